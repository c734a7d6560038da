//! Operator tool: provisions a tenant and prints its API key once.
//!
//! Usage: `create_team <name>`

use base64ct::{Base64Unpadded, Encoding};
use mailroom::models::TeamRepository;
use rand::RngCore;
use sqlx::postgres::PgPoolOptions;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    mailroom::init_tracing();

    let name = std::env::args()
        .nth(1)
        .expect("usage: create_team <name>");

    let database_url =
        std::env::var("DATABASE_URL").expect("Missing DATABASE_URL environment variable");
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(&database_url)
        .await?;

    let mut key_bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut key_bytes);
    let api_key = format!("mk_{}", Base64Unpadded::encode_string(&key_bytes));

    let team = TeamRepository::new(pool).create(&name, &api_key).await?;

    println!("team id: {}", team.id);
    println!("api key: {api_key}");

    Ok(())
}
