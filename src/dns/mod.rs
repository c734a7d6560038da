use serde::{Deserialize, Serialize};
use std::ops::Range;
use tracing::{debug, trace};

#[cfg(not(test))]
use hickory_resolver::{
    Resolver,
    config::{LookupIpStrategy::Ipv4Only, ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
    proto::rr::{RData, RecordType},
};

#[cfg(test)]
pub mod mock;

pub enum ResolveError {
    Dns(String),
    AllServersExhausted,
}

/// Outcome of checking a single published DNS record against its expected
/// value. A failed *lookup* is not a failed *record*: transient resolver
/// errors must never flip a verified domain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub enum RecordCheck {
    Verified,
    Mismatch(String),
    Unavailable(String),
}

impl RecordCheck {
    pub fn mismatch(reason: impl Into<String>) -> Self {
        RecordCheck::Mismatch(reason.into())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RecordCheck::Unavailable(reason.into())
    }
}

#[derive(Clone)]
pub struct DnsResolver {
    #[cfg(not(test))]
    resolver: Resolver<TokioConnectionProvider>,
    #[cfg(test)]
    pub(crate) resolver: mock::Resolver,
}

#[cfg(not(test))]
impl Default for DnsResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsResolver {
    #[cfg(not(test))]
    pub fn new() -> Self {
        let mut resolver_options = ResolverOpts::default();
        resolver_options.ip_strategy = Ipv4Only;
        resolver_options.timeout = std::time::Duration::from_secs(5);
        resolver_options.negative_max_ttl = Some(std::time::Duration::from_secs(20));
        resolver_options.attempts = 2;

        Self {
            resolver: Resolver::builder_with_config(
                ResolverConfig::cloudflare(),
                TokioConnectionProvider::default(),
            )
            .with_options(resolver_options)
            .build(),
        }
    }

    #[cfg(test)]
    pub fn mock(resolver: mock::Resolver) -> Self {
        Self { resolver }
    }

    /// Picks the next untried MX server for a recipient domain, falling
    /// back to the apex host when the domain publishes no MX at all.
    pub async fn resolve_mail_domain(
        &self,
        domain: &str,
        prio: &mut Range<u32>,
    ) -> Result<(String, u16), ResolveError> {
        let smtp_port = 25;

        // queries ending with a '.' are fully qualified and cheaper
        let domain = format!("{domain}{}", if domain.ends_with('.') { "" } else { "." });

        // a domain without MX records still receives mail on its apex;
        // only an actual resolver failure aborts the attempt
        let lookup = match self.resolver.mx_lookup(&domain).await {
            Ok(lookup) => Some(lookup),
            Err(e) if e.is_no_records_found() => None,
            Err(e) => return Err(ResolveError::Dns(e.to_string())),
        };

        let Some(destination) = lookup
            .iter()
            .flat_map(|l| l.iter())
            .filter(|mx| prio.contains(&u32::from(mx.preference())))
            .min_by_key(|mx| mx.preference())
        else {
            return if prio.contains(&0) {
                prio.start = u32::MAX;
                Ok((domain, smtp_port))
            } else {
                Err(ResolveError::AllServersExhausted)
            };
        };

        #[cfg(test)]
        let smtp_port = destination.port();

        // don't offer this server again if it fails us
        prio.start = u32::from(destination.preference()) + 1;

        debug!("trying mail server: {destination:?}");
        Ok((destination.exchange().to_utf8(), smtp_port))
    }

    /// A definitive "no records" answer yields an empty list; only server
    /// errors and timeouts surface as `Err`.
    async fn txt_records(&self, name: &str) -> Result<Vec<String>, String> {
        trace!("requesting TXT records for {name}");
        let lookup = match self.resolver.txt_lookup(name).await {
            Ok(lookup) => lookup,
            Err(e) if e.is_no_records_found() => return Ok(Vec::new()),
            Err(e) => return Err(format!("TXT lookup failed: {e}")),
        };

        Ok(lookup
            .iter()
            .map(|txt| {
                let data: Vec<u8> = txt.txt_data().iter().flatten().copied().collect();
                String::from_utf8_lossy(&data).into_owned()
            })
            .collect())
    }

    async fn singular_txt_record(&self, name: &str, starting_with: &str) -> RecordLookup {
        let records = match self.txt_records(name).await {
            Ok(records) => records,
            Err(reason) => return RecordLookup::Unavailable(reason),
        };

        let mut matching = records.into_iter().filter(|r| r.starts_with(starting_with));
        let Some(first) = matching.next() else {
            return RecordLookup::Absent;
        };
        if matching.next().is_some() {
            return RecordLookup::Conflicting;
        }

        RecordLookup::Found(first)
    }

    /// SPF: the apex TXT record must carry `v=spf1` and the expected
    /// include; a missing record or missing include fails the check.
    pub async fn verify_spf(&self, domain: &str, spf_include: &str) -> RecordCheck {
        let name = format!("{}.", domain.trim_matches('.'));
        let spf_data = match self.singular_txt_record(&name, "v=spf1").await {
            RecordLookup::Found(data) => data,
            RecordLookup::Absent => return RecordCheck::mismatch("no SPF record published"),
            RecordLookup::Conflicting => {
                return RecordCheck::mismatch("multiple conflicting SPF records");
            }
            RecordLookup::Unavailable(reason) => return RecordCheck::unavailable(reason),
        };
        trace!("spf data: {spf_data:?}");

        let include = format!("include:{spf_include}");
        if spf_data.split(' ').any(|x| x == include) {
            RecordCheck::Verified
        } else {
            RecordCheck::Mismatch(format!("SPF record is missing \"{include}\": {spf_data}"))
        }
    }

    /// DKIM: the `p=` value of the selector record must equal the domain's
    /// published public key.
    pub async fn verify_dkim(
        &self,
        domain: &str,
        selector: &str,
        expected_p_value: &str,
    ) -> RecordCheck {
        let name = format!("{selector}._domainkey.{}.", domain.trim_matches('.'));
        let dkim_data = match self.singular_txt_record(&name, "v=DKIM1").await {
            RecordLookup::Found(data) => data,
            RecordLookup::Absent => return RecordCheck::mismatch("no DKIM record published"),
            RecordLookup::Conflicting => {
                return RecordCheck::mismatch("multiple conflicting DKIM records");
            }
            RecordLookup::Unavailable(reason) => return RecordCheck::unavailable(reason),
        };
        trace!("dkim data: {dkim_data:?}");

        let Some(p_value) = dkim_data
            .split(';')
            .filter_map(|field| field.trim().split_once('='))
            .find(|(key, _)| *key == "p")
            .map(|(_, value)| value.trim().to_string())
        else {
            return RecordCheck::mismatch("DKIM record has no public key");
        };

        if p_value == expected_p_value {
            RecordCheck::Verified
        } else {
            RecordCheck::mismatch("public key in DKIM record does not match")
        }
    }

    /// MX: some published server must point at the expected host;
    /// priority is compared when the expectation carries one.
    pub async fn verify_mx(
        &self,
        domain: &str,
        expected_host: &str,
        expected_priority: Option<u16>,
    ) -> RecordCheck {
        let name = format!("{}.", domain.trim_matches('.'));
        let lookup = match self.resolver.mx_lookup(&name).await {
            Ok(lookup) => lookup,
            Err(e) if e.is_no_records_found() => {
                return RecordCheck::mismatch("no MX record published");
            }
            Err(e) => return RecordCheck::unavailable(format!("MX lookup failed: {e}")),
        };

        let expected_host = expected_host.trim_end_matches('.');
        let mut found_host = false;
        for mx in lookup.iter() {
            let exchange = mx.exchange().to_utf8();
            if exchange.trim_end_matches('.') == expected_host {
                found_host = true;
                if expected_priority.is_none_or(|p| p == mx.preference()) {
                    return RecordCheck::Verified;
                }
            }
        }

        if found_host {
            RecordCheck::mismatch("MX host found but with unexpected priority")
        } else {
            RecordCheck::mismatch("no MX record points at the expected host")
        }
    }

    /// DMARC: reported but non-critical; any `v=DMARC1` record passes.
    pub async fn verify_dmarc(&self, domain: &str) -> RecordCheck {
        let name = format!("_dmarc.{}.", domain.trim_matches('.'));
        match self.singular_txt_record(&name, "v=DMARC1").await {
            RecordLookup::Found(_) => RecordCheck::Verified,
            RecordLookup::Absent => RecordCheck::mismatch("no DMARC record published"),
            RecordLookup::Conflicting => RecordCheck::mismatch("multiple conflicting DMARC records"),
            RecordLookup::Unavailable(reason) => RecordCheck::unavailable(reason),
        }
    }

    /// Return-path CNAME, compared exactly after trailing-dot
    /// normalization.
    pub async fn verify_return_path(&self, record_name: &str, expected_target: &str) -> RecordCheck {
        let name = format!("{}.", record_name.trim_matches('.'));
        let target = match self.cname_lookup(&name).await {
            Ok(Some(target)) => target,
            Ok(None) => return RecordCheck::mismatch("no CNAME record published"),
            Err(reason) => return RecordCheck::unavailable(reason),
        };

        if target.trim_end_matches('.') == expected_target.trim_end_matches('.') {
            RecordCheck::Verified
        } else {
            RecordCheck::Mismatch(format!("CNAME points at {target}"))
        }
    }

    #[cfg(not(test))]
    async fn cname_lookup(&self, name: &str) -> Result<Option<String>, String> {
        let lookup = match self.resolver.lookup(name, RecordType::CNAME).await {
            Ok(lookup) => lookup,
            Err(e) if e.is_no_records_found() => return Ok(None),
            Err(e) => return Err(format!("CNAME lookup failed: {e}")),
        };

        Ok(lookup.iter().find_map(|rdata| match rdata {
            RData::CNAME(target) => Some(target.0.to_utf8()),
            _ => None,
        }))
    }

    #[cfg(test)]
    async fn cname_lookup(&self, name: &str) -> Result<Option<String>, String> {
        self.resolver.cname_lookup(name)
    }
}

enum RecordLookup {
    Found(String),
    Absent,
    Conflicting,
    Unavailable(String),
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::dns::mock::Resolver;

    const P_VALUE: &str = "MIIBIjANBgkqAAAA";

    fn resolver() -> Resolver {
        let mut mock = Resolver::default();
        mock.add_txt("x.test.", "v=spf1 include:spf.mailroom.test ~all");
        mock.add_txt("mr1._domainkey.x.test.", &format!("v=DKIM1; k=rsa; p={P_VALUE}"));
        mock.add_txt("_dmarc.x.test.", "v=DMARC1; p=none");
        mock.add_mx("x.test.", 10, "mx.mailroom.test.", 25);
        mock.add_cname("bounce.x.test.", "rp.mailroom.test.");
        mock
    }

    #[tokio::test]
    async fn spf_verification() {
        let dns = DnsResolver::mock(resolver());
        assert_eq!(
            dns.verify_spf("x.test", "spf.mailroom.test").await,
            RecordCheck::Verified
        );
        assert!(matches!(
            dns.verify_spf("x.test", "spf.other.test").await,
            RecordCheck::Mismatch(_)
        ));
        assert!(matches!(
            dns.verify_spf("missing.test", "spf.mailroom.test").await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn spf_lookup_failure_is_not_a_mismatch() {
        let mut mock = resolver();
        mock.fail_lookups_for("x.test.");
        let dns = DnsResolver::mock(mock);
        assert!(matches!(
            dns.verify_spf("x.test", "spf.mailroom.test").await,
            RecordCheck::Unavailable(_)
        ));
    }

    #[tokio::test]
    async fn dkim_verification() {
        let dns = DnsResolver::mock(resolver());
        assert_eq!(
            dns.verify_dkim("x.test", "mr1", P_VALUE).await,
            RecordCheck::Verified
        );
        assert!(matches!(
            dns.verify_dkim("x.test", "mr1", "otherkey").await,
            RecordCheck::Mismatch(_)
        ));
        assert!(matches!(
            dns.verify_dkim("x.test", "wrong-selector", P_VALUE).await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn mx_verification() {
        let dns = DnsResolver::mock(resolver());
        assert_eq!(
            dns.verify_mx("x.test", "mx.mailroom.test", Some(10)).await,
            RecordCheck::Verified
        );
        assert_eq!(
            dns.verify_mx("x.test", "mx.mailroom.test", None).await,
            RecordCheck::Verified
        );
        assert!(matches!(
            dns.verify_mx("x.test", "mx.mailroom.test", Some(20)).await,
            RecordCheck::Mismatch(_)
        ));
        assert!(matches!(
            dns.verify_mx("x.test", "mx.elsewhere.test", None).await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn dmarc_verification() {
        let dns = DnsResolver::mock(resolver());
        assert_eq!(dns.verify_dmarc("x.test").await, RecordCheck::Verified);
        assert!(matches!(
            dns.verify_dmarc("missing.test").await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn return_path_verification_normalizes_trailing_dots() {
        let dns = DnsResolver::mock(resolver());
        assert_eq!(
            dns.verify_return_path("bounce.x.test", "rp.mailroom.test").await,
            RecordCheck::Verified
        );
        assert_eq!(
            dns.verify_return_path("bounce.x.test", "rp.mailroom.test.").await,
            RecordCheck::Verified
        );
        assert!(matches!(
            dns.verify_return_path("bounce.x.test", "rp.other.test").await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn conflicting_txt_records_are_rejected() {
        let mut mock = resolver();
        mock.add_txt("x.test.", "v=spf1 include:second.test -all");
        let dns = DnsResolver::mock(mock);
        assert!(matches!(
            dns.verify_spf("x.test", "spf.mailroom.test").await,
            RecordCheck::Mismatch(_)
        ));
    }

    #[tokio::test]
    async fn mail_domain_resolution_walks_priorities() {
        let mut mock = Resolver::default();
        mock.add_mx("y.test.", 10, "primary.y.test.", 2525);
        mock.add_mx("y.test.", 20, "backup.y.test.", 2526);
        let dns = DnsResolver::mock(mock);

        let mut prio = 0..65536;
        let (host, port) = dns.resolve_mail_domain("y.test", &mut prio).await.ok().unwrap();
        assert_eq!((host.as_str(), port), ("primary.y.test.", 2525));

        let (host, port) = dns.resolve_mail_domain("y.test", &mut prio).await.ok().unwrap();
        assert_eq!((host.as_str(), port), ("backup.y.test.", 2526));

        assert!(matches!(
            dns.resolve_mail_domain("y.test", &mut prio).await,
            Err(ResolveError::AllServersExhausted)
        ));
    }

    #[tokio::test]
    async fn mail_domain_falls_back_to_apex_without_mx() {
        let dns = DnsResolver::mock(Resolver::default());
        let mut prio = 0..65536;
        let (host, _) = dns.resolve_mail_domain("nomx.test", &mut prio).await.ok().unwrap();
        assert_eq!(host, "nomx.test.");

        // the apex fallback is only offered once
        assert!(matches!(
            dns.resolve_mail_domain("nomx.test", &mut prio).await,
            Err(ResolveError::AllServersExhausted)
        ));
    }
}
