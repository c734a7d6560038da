use crate::{
    dkim,
    dns::RecordCheck,
    models::{DnsRecordStatus, DnsRecordType, DomainStatus},
    pipeline::{Pipeline, PipelineError},
    queue::{Task, VerifyPayload},
};
use std::collections::HashSet;
use tracing::{info, warn};

impl Pipeline {
    /// The `domain:verify` handler: live-checks every published record,
    /// updates per-record status, and derives the domain status from the
    /// critical three (SPF, DKIM, MX).
    #[tracing::instrument(skip(self, task), fields(task_id = task.id.to_string()))]
    pub(crate) async fn handle_domain_verify(&self, task: &Task) -> Result<(), PipelineError> {
        let payload: VerifyPayload = task.parse_payload()?;

        let domain = match self.domains.get(payload.team_id, payload.domain_id).await {
            Ok(domain) => domain,
            Err(crate::models::Error::NotFound(_)) => {
                warn!(domain_id = payload.domain_id.to_string(), "domain vanished, dropping task");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let records = self.domains.records(domain.id).await?;
        let expected_p_value = dkim::public_key_txt_value(&domain.dkim_public_key);
        let settings = &self.config.domain_settings;

        let mut verified_criticals: HashSet<DnsRecordType> = HashSet::new();
        let mut failed_criticals: HashSet<DnsRecordType> = HashSet::new();
        let mut critical_unavailable = false;

        for record in &records {
            let check = match record.record_type {
                DnsRecordType::Spf => {
                    self.resolver.verify_spf(&domain.name, &settings.spf_include).await
                }
                DnsRecordType::Dkim => {
                    self.resolver
                        .verify_dkim(&domain.name, &domain.dkim_selector, &expected_p_value)
                        .await
                }
                DnsRecordType::Mx => {
                    self.resolver.verify_mx(&domain.name, &settings.mx_host, None).await
                }
                DnsRecordType::Dmarc => self.resolver.verify_dmarc(&domain.name).await,
                DnsRecordType::ReturnPath => {
                    self.resolver
                        .verify_return_path(&record.name, &settings.return_path_host)
                        .await
                }
            };

            let (status, error) = match &check {
                RecordCheck::Verified => (DnsRecordStatus::Verified, None),
                RecordCheck::Mismatch(reason) => (DnsRecordStatus::Failed, Some(reason.as_str())),
                // a lookup failure is not evidence the record is wrong: keep
                // the previous status so a resolver hiccup cannot flip a
                // verified domain
                RecordCheck::Unavailable(reason) => (record.status, Some(reason.as_str())),
            };

            self.domains.update_record_status(record.id, status, error).await?;

            if record.record_type.is_critical() {
                match &check {
                    RecordCheck::Verified => {
                        verified_criticals.insert(record.record_type);
                    }
                    RecordCheck::Mismatch(_) => {
                        failed_criticals.insert(record.record_type);
                    }
                    RecordCheck::Unavailable(_) => critical_unavailable = true,
                }
            }
        }

        if critical_unavailable {
            info!(
                domain = domain.name,
                "verification inconclusive, keeping domain status {:?}", domain.status
            );
            return Ok(());
        }

        // every critical record type must exist and verify; a duplicated
        // row only counts when all its copies passed
        let all_criticals_verified = DnsRecordType::ALL
            .into_iter()
            .filter(|record_type| record_type.is_critical())
            .all(|record_type| {
                verified_criticals.contains(&record_type)
                    && !failed_criticals.contains(&record_type)
            });

        let new_status = if all_criticals_verified {
            DomainStatus::Verified
        } else {
            DomainStatus::Failed
        };

        if new_status != domain.status {
            info!(domain = domain.name, ?new_status, "domain status changed");
            self.domains.set_status(domain.id, new_status).await?;
        }

        Ok(())
    }
}
