// Copyright © 2026 The virt-scenario Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::subject::Subject;

#[derive(Error, Debug)]
pub enum EnvError {
    #[error("no subject named '{0}' in the environment")]
    NotFound(String),
}

/// Registry of live subject handles, looked up by name.
#[derive(Clone, Default)]
pub struct Env {
    subjects: BTreeMap<String, Arc<dyn Subject>>,
}

impl Env {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, subject: Arc<dyn Subject>) -> &mut Self {
        self.subjects.insert(subject.name().to_owned(), subject);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Subject>, EnvError> {
        self.subjects
            .get(name)
            .cloned()
            .ok_or_else(|| EnvError::NotFound(name.to_owned()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.subjects.keys().map(|k| k.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::InMemoryDomain;

    #[test]
    fn test_env_lookup() {
        let mut env = Env::new();
        env.register(Arc::new(InMemoryDomain::undefined("vm2")))
            .register(Arc::new(InMemoryDomain::undefined("vm1")));

        assert_eq!(env.get("vm1").unwrap().name(), "vm1");
        assert!(matches!(env.get("vm3"), Err(EnvError::NotFound(n)) if n == "vm3"));
        assert_eq!(env.names().collect::<Vec<_>>(), vec!["vm1", "vm2"]);
    }
}
