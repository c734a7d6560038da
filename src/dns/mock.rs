//! A minimal in-memory stand-in for the hickory resolver, mirroring the
//! subset of its surface the production code touches.

use std::collections::{HashMap, HashSet};
use std::fmt;

#[derive(Debug)]
pub struct LookupFailure(pub String);

impl LookupFailure {
    /// Mock failures model outages, never definitive negative answers;
    /// absent records are expressed as empty lookups instead.
    pub fn is_no_records_found(&self) -> bool {
        false
    }
}

impl fmt::Display for LookupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, Default)]
pub struct Resolver {
    txt: HashMap<String, Vec<String>>,
    mx: HashMap<String, Vec<MxEntry>>,
    cname: HashMap<String, String>,
    failing: HashSet<String>,
}

#[derive(Clone, Debug)]
struct MxEntry {
    preference: u16,
    exchange: String,
    port: u16,
}

impl Resolver {
    pub fn add_txt(&mut self, name: &str, value: &str) {
        self.txt
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    pub fn add_mx(&mut self, name: &str, preference: u16, exchange: &str, port: u16) {
        self.mx.entry(name.to_string()).or_default().push(MxEntry {
            preference,
            exchange: exchange.to_string(),
            port,
        });
    }

    pub fn add_cname(&mut self, name: &str, target: &str) {
        self.cname.insert(name.to_string(), target.to_string());
    }

    /// Every lookup for this name fails, simulating a resolver outage.
    pub fn fail_lookups_for(&mut self, name: &str) {
        self.failing.insert(name.to_string());
    }

    fn check_failing(&self, name: &str) -> Result<(), LookupFailure> {
        if self.failing.contains(name) {
            Err(LookupFailure(format!("simulated DNS failure for {name}")))
        } else {
            Ok(())
        }
    }

    pub async fn txt_lookup(&self, name: impl AsRef<str>) -> Result<Vec<Txt>, LookupFailure> {
        let name = name.as_ref();
        self.check_failing(name)?;
        Ok(self
            .txt
            .get(name)
            .into_iter()
            .flatten()
            .map(|value| Txt(value.clone()))
            .collect())
    }

    pub async fn mx_lookup(&self, name: impl AsRef<str>) -> Result<Vec<Mx>, LookupFailure> {
        let name = name.as_ref();
        self.check_failing(name)?;
        Ok(self
            .mx
            .get(name)
            .into_iter()
            .flatten()
            .map(|entry| Mx(entry.clone()))
            .collect())
    }

    pub fn cname_lookup(&self, name: &str) -> Result<Option<String>, String> {
        self.check_failing(name).map_err(|e| e.to_string())?;
        Ok(self.cname.get(name).cloned())
    }
}

#[derive(Debug)]
pub struct Txt(String);

impl Txt {
    pub fn txt_data(&self) -> [Vec<u8>; 1] {
        [self.0.as_bytes().to_vec()]
    }
}

#[derive(Debug)]
pub struct Mx(MxEntry);

impl Mx {
    pub fn preference(&self) -> u16 {
        self.0.preference
    }

    pub fn exchange(&self) -> ToStr {
        ToStr(self.0.exchange.clone())
    }

    pub fn port(&self) -> u16 {
        self.0.port
    }
}

pub struct ToStr(String);

impl ToStr {
    pub fn to_utf8(&self) -> String {
        self.0.clone()
    }
}
