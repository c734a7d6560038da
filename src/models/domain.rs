use crate::{
    dkim::{self, KeyVault},
    models::{Error, TeamId},
};
use chrono::{DateTime, Utc};
use derive_more::{Deref, Display, From, FromStr};
use serde::{Deserialize, Serialize};
use sqlx::PgConnection;
use uuid::Uuid;

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, From, Display, Deref,
    sqlx::Type, FromStr,
)]
#[sqlx(transparent)]
pub struct DomainId(Uuid);

impl DomainId {
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "domain_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DomainStatus {
    Pending,
    Verified,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type, Default)]
#[sqlx(type_name = "tls_policy", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TlsPolicy {
    #[default]
    Opportunistic,
    Required,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "dns_record_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DnsRecordType {
    Spf,
    Dkim,
    Mx,
    Dmarc,
    ReturnPath,
}

impl DnsRecordType {
    pub const ALL: [DnsRecordType; 5] = [
        DnsRecordType::Spf,
        DnsRecordType::Dkim,
        DnsRecordType::Mx,
        DnsRecordType::Dmarc,
        DnsRecordType::ReturnPath,
    ];

    /// SPF, DKIM and MX gate the domain status; DMARC and the return-path
    /// CNAME are reported but non-critical.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            DnsRecordType::Spf | DnsRecordType::Dkim | DnsRecordType::Mx
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[sqlx(type_name = "dns_record_status", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum DnsRecordStatus {
    Pending,
    Verified,
    Failed,
}

#[derive(
    Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, From, Display, Deref, sqlx::Type,
    FromStr,
)]
#[sqlx(transparent)]
pub struct DnsRecordId(Uuid);

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct DomainDnsRecord {
    pub id: DnsRecordId,
    pub domain_id: DomainId,
    pub record_type: DnsRecordType,
    pub name: String,
    pub expected_value: String,
    pub status: DnsRecordStatus,
    pub last_error: Option<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Domain {
    pub id: DomainId,
    pub team_id: TeamId,
    pub name: String,
    pub status: DomainStatus,
    pub dkim_selector: String,
    #[serde(skip_serializing)]
    pub dkim_private_key: Vec<u8>,
    #[serde(skip_serializing)]
    pub dkim_public_key: Vec<u8>,
    pub open_tracking: bool,
    pub click_tracking: bool,
    pub tls_policy: TlsPolicy,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Published-record templates for the tenant's DNS zone.
#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub dkim_selector: String,
    pub spf_include: String,
    pub mx_host: String,
    pub return_path_host: String,
}

impl DomainSettings {
    pub fn record_name(&self, record_type: DnsRecordType, domain: &str) -> String {
        match record_type {
            DnsRecordType::Spf | DnsRecordType::Mx => domain.to_string(),
            DnsRecordType::Dkim => format!("{}._domainkey.{domain}", self.dkim_selector),
            DnsRecordType::Dmarc => format!("_dmarc.{domain}"),
            DnsRecordType::ReturnPath => format!("bounce.{domain}"),
        }
    }

    pub fn expected_value(&self, record_type: DnsRecordType, public_der: &[u8]) -> String {
        match record_type {
            DnsRecordType::Spf => format!("v=spf1 include:{} ~all", self.spf_include),
            DnsRecordType::Dkim => format!(
                "v=DKIM1; k=rsa; p={}",
                dkim::public_key_txt_value(public_der)
            ),
            DnsRecordType::Mx => format!("10 {}", self.mx_host),
            DnsRecordType::Dmarc => "v=DMARC1; p=none".to_string(),
            DnsRecordType::ReturnPath => self.return_path_host.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct NewDomain {
    pub name: String,
    #[serde(default)]
    pub tls_policy: TlsPolicy,
}

const DOMAIN_COLUMNS: &str = r#"
    id, team_id, name, status, dkim_selector, dkim_private_key, dkim_public_key,
    open_tracking, click_tracking, tls_policy, created_at, updated_at
"#;

#[derive(Clone)]
pub struct DomainRepository {
    pool: sqlx::PgPool,
}

impl DomainRepository {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }

    /// Creates the domain `pending` with a fresh RSA-2048 keypair (private
    /// half sealed by the vault) plus the five expected DNS record rows.
    pub async fn create(
        &self,
        team_id: TeamId,
        new: &NewDomain,
        settings: &DomainSettings,
        vault: &KeyVault,
    ) -> Result<Domain, Error> {
        let generated = dkim::generate_rsa_keypair()
            .map_err(|e| Error::Internal(format!("DKIM key generation failed: {e}")))?;
        let sealed = vault
            .seal(&generated.private_der)
            .map_err(|e| Error::Internal(format!("could not seal DKIM key: {e}")))?;

        let mut tx = self.pool.begin().await?;

        let domain = sqlx::query_as::<_, Domain>(&format!(
            r#"
            INSERT INTO domains
                (team_id, name, dkim_selector, dkim_private_key, dkim_public_key, tls_policy)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {DOMAIN_COLUMNS}
            "#
        ))
        .bind(team_id)
        .bind(&new.name)
        .bind(&settings.dkim_selector)
        .bind(&sealed)
        .bind(&generated.public_der)
        .bind(new.tls_policy)
        .fetch_one(&mut *tx)
        .await?;

        for record_type in DnsRecordType::ALL {
            Self::insert_record(
                &mut tx,
                domain.id,
                &domain.name,
                record_type,
                settings,
                &generated.public_der,
            )
            .await?;
        }

        tx.commit().await?;

        Ok(domain)
    }

    async fn insert_record(
        tx: &mut PgConnection,
        domain_id: DomainId,
        domain_name: &str,
        record_type: DnsRecordType,
        settings: &DomainSettings,
        public_der: &[u8],
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            INSERT INTO domain_dns_records (domain_id, record_type, name, expected_value)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(domain_id)
        .bind(record_type)
        .bind(settings.record_name(record_type, domain_name))
        .bind(settings.expected_value(record_type, public_der))
        .execute(tx)
        .await?;

        Ok(())
    }

    pub async fn get(&self, team_id: TeamId, id: DomainId) -> Result<Domain, Error> {
        let domain = sqlx::query_as::<_, Domain>(&format!(
            r#"
            SELECT {DOMAIN_COLUMNS}
            FROM domains
            WHERE team_id = $1 AND id = $2
            "#
        ))
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(domain)
    }

    pub async fn list(&self, team_id: TeamId) -> Result<Vec<Domain>, Error> {
        let domains = sqlx::query_as::<_, Domain>(&format!(
            r#"
            SELECT {DOMAIN_COLUMNS}
            FROM domains
            WHERE team_id = $1
            ORDER BY created_at
            "#
        ))
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(domains)
    }

    pub async fn remove(&self, team_id: TeamId, id: DomainId) -> Result<(), Error> {
        sqlx::query_scalar::<_, Uuid>(
            r#"
            DELETE FROM domains
            WHERE team_id = $1 AND id = $2
            RETURNING id
            "#,
        )
        .bind(team_id)
        .bind(id)
        .fetch_one(&self.pool)
        .await?;

        Ok(())
    }

    /// DKIM credential resolution for the send pipeline: the from-address
    /// domain must match a verified domain of the same team.
    pub async fn find_verified_by_name(
        &self,
        team_id: TeamId,
        name: &str,
    ) -> Result<Option<Domain>, Error> {
        let domain = sqlx::query_as::<_, Domain>(&format!(
            r#"
            SELECT {DOMAIN_COLUMNS}
            FROM domains
            WHERE team_id = $1 AND name = $2 AND status = 'verified'
            "#
        ))
        .bind(team_id)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(domain)
    }

    /// Inbound RCPT lookup crosses all teams on purpose: the matched
    /// domain's team becomes the session team.
    pub async fn find_verified_by_name_any_team(
        &self,
        name: &str,
    ) -> Result<Option<Domain>, Error> {
        let domain = sqlx::query_as::<_, Domain>(&format!(
            r#"
            SELECT {DOMAIN_COLUMNS}
            FROM domains
            WHERE name = $1 AND status = 'verified'
            "#
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(domain)
    }

    pub async fn records(&self, domain_id: DomainId) -> Result<Vec<DomainDnsRecord>, Error> {
        let records = sqlx::query_as::<_, DomainDnsRecord>(
            r#"
            SELECT id, domain_id, record_type, name, expected_value, status, last_error, checked_at
            FROM domain_dns_records
            WHERE domain_id = $1
            ORDER BY record_type
            "#,
        )
        .bind(domain_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    pub async fn update_record_status(
        &self,
        record_id: DnsRecordId,
        status: DnsRecordStatus,
        last_error: Option<&str>,
    ) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE domain_dns_records
            SET status = $2, last_error = $3, checked_at = now()
            WHERE id = $1
            "#,
        )
        .bind(record_id)
        .bind(status)
        .bind(last_error)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn set_status(&self, id: DomainId, status: DomainStatus) -> Result<(), Error> {
        sqlx::query(
            r#"
            UPDATE domains
            SET status = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(status)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Domains whose records have not been checked recently, for the
    /// periodic re-verification sweep.
    pub async fn stale(
        &self,
        checked_before: DateTime<Utc>,
    ) -> Result<Vec<(DomainId, TeamId)>, Error> {
        let rows = sqlx::query_as::<_, (DomainId, TeamId)>(
            r#"
            SELECT DISTINCT d.id, d.team_id
            FROM domains d
                JOIN domain_dns_records r ON r.domain_id = d.id
            WHERE r.checked_at IS NULL OR r.checked_at < $1
            "#,
        )
        .bind(checked_before)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn settings() -> DomainSettings {
        DomainSettings {
            dkim_selector: "mr1".to_string(),
            spf_include: "spf.mailroom.test".to_string(),
            mx_host: "mx.mailroom.test".to_string(),
            return_path_host: "rp.mailroom.test".to_string(),
        }
    }

    #[test]
    fn record_names_follow_the_published_layout() {
        let s = settings();
        assert_eq!(s.record_name(DnsRecordType::Spf, "x.test"), "x.test");
        assert_eq!(
            s.record_name(DnsRecordType::Dkim, "x.test"),
            "mr1._domainkey.x.test"
        );
        assert_eq!(s.record_name(DnsRecordType::Mx, "x.test"), "x.test");
        assert_eq!(s.record_name(DnsRecordType::Dmarc, "x.test"), "_dmarc.x.test");
        assert_eq!(
            s.record_name(DnsRecordType::ReturnPath, "x.test"),
            "bounce.x.test"
        );
    }

    #[test]
    fn expected_values_carry_the_distinguishing_tags() {
        let s = settings();
        let public_der = [1u8, 2, 3];
        assert_eq!(
            s.expected_value(DnsRecordType::Spf, &public_der),
            "v=spf1 include:spf.mailroom.test ~all"
        );
        assert!(
            s.expected_value(DnsRecordType::Dkim, &public_der)
                .starts_with("v=DKIM1; k=rsa; p=")
        );
        assert_eq!(
            s.expected_value(DnsRecordType::Mx, &public_der),
            "10 mx.mailroom.test"
        );
        assert_eq!(
            s.expected_value(DnsRecordType::Dmarc, &public_der),
            "v=DMARC1; p=none"
        );
    }

    #[test]
    fn only_spf_dkim_mx_are_critical() {
        let critical: Vec<_> = DnsRecordType::ALL
            .into_iter()
            .filter(|r| r.is_critical())
            .collect();
        assert_eq!(
            critical,
            vec![DnsRecordType::Spf, DnsRecordType::Dkim, DnsRecordType::Mx]
        );
    }
}
