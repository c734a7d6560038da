use crate::{
    pipeline::{Pipeline, PipelineError},
    queue::{ContactImportPayload, Task},
};
use email_address::EmailAddress;
use tracing::{info, warn};

impl Pipeline {
    /// The `contact:import` handler: bulk-upserts pre-parsed rows into an
    /// audience. Invalid rows are skipped, not fatal.
    pub(crate) async fn handle_contact_import(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: ContactImportPayload = task.parse_payload()?;

        // cross-team audience ids surface as not found
        let audience = match self
            .audiences
            .get(payload.team_id, payload.audience_id)
            .await
        {
            Ok(audience) => audience,
            Err(crate::models::Error::NotFound(_)) => {
                warn!(
                    audience_id = payload.audience_id.to_string(),
                    "import target audience vanished, dropping task"
                );
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut imported = 0usize;
        let mut skipped = 0usize;
        for row in &payload.rows {
            if row.email.parse::<EmailAddress>().is_err() {
                skipped += 1;
                continue;
            }
            match self.audiences.upsert_contact(audience.id, row).await {
                Ok(()) => imported += 1,
                Err(e) => {
                    warn!(email = row.email, "failed to import contact: {e}");
                    skipped += 1;
                }
            }
        }

        info!(
            audience_id = audience.id.to_string(),
            imported, skipped, "contact import complete"
        );

        Ok(())
    }
}
