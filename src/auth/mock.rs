//! Programmable in-memory stand-in for the hickory resolver, keyed by
//! lowercased name without the trailing dot.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;

use crate::auth::resolver::{LookupError, LookupResult};

#[derive(Clone, Default)]
pub struct Resolver {
    txt: HashMap<String, Vec<String>>,
    ip: HashMap<String, Vec<IpAddr>>,
    mx: HashMap<String, Vec<String>>,
    /// Names that fail with a transient error instead of answering.
    transient: HashSet<String>,
}

fn key(name: &str) -> String {
    name.trim_end_matches('.').to_ascii_lowercase()
}

impl Resolver {
    pub fn txt_record(mut self, name: &str, value: &str) -> Self {
        self.txt.entry(key(name)).or_default().push(value.to_string());
        self
    }

    pub fn a_record(mut self, name: &str, addr: IpAddr) -> Self {
        self.ip.entry(key(name)).or_default().push(addr);
        self
    }

    pub fn mx_record(mut self, name: &str, exchange: &str) -> Self {
        self.mx.entry(key(name)).or_default().push(exchange.to_string());
        self
    }

    pub fn transient_failure(mut self, name: &str) -> Self {
        self.transient.insert(key(name));
        self
    }

    fn lookup<T: Clone>(&self, map: &HashMap<String, Vec<T>>, name: &str) -> LookupResult<Vec<T>> {
        let key = key(name);
        if self.transient.contains(&key) {
            return Err(LookupError::Transient("mock timeout".to_string()));
        }
        match map.get(&key) {
            Some(records) if !records.is_empty() => Ok(records.clone()),
            _ => Err(LookupError::NotFound),
        }
    }

    pub fn txt(&self, name: &str) -> LookupResult<Vec<String>> {
        self.lookup(&self.txt, name)
    }

    pub fn ip(&self, name: &str) -> LookupResult<Vec<IpAddr>> {
        self.lookup(&self.ip, name)
    }

    pub fn mx(&self, name: &str) -> LookupResult<Vec<String>> {
        self.lookup(&self.mx, name)
    }
}
