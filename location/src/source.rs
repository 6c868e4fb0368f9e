//! Where relay rules come from.
use crate::LocationError;
use crate::rules::Rules;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

pub trait RuleSource: Send + Sync {
    /// Changes whenever the rules may have changed. `None` when the source cannot tell.
    fn fingerprint(&self) -> Option<SystemTime>;
    fn load(&self) -> Result<Rules, LocationError>;
    fn describe(&self) -> String;
}

/// YAML rule file, fingerprinted by its modification time.
pub struct FileRuleSource {
    path: PathBuf,
}

impl FileRuleSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        FileRuleSource {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl RuleSource for FileRuleSource {
    fn fingerprint(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }

    fn load(&self) -> Result<Rules, LocationError> {
        let contents = fs::read_to_string(&self.path).map_err(|source| LocationError::Io {
            path: self.path.clone(),
            source,
        })?;
        Rules::from_yaml(&contents)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory rules. `replace` bumps the fingerprint so the next reload picks them up.
pub struct StaticRuleSource {
    inner: Mutex<(Rules, SystemTime)>,
}

impl StaticRuleSource {
    pub fn new(rules: Rules) -> Self {
        StaticRuleSource {
            inner: Mutex::new((rules, SystemTime::now())),
        }
    }

    pub fn replace(&self, rules: Rules) {
        *self.inner.lock() = (rules, SystemTime::now());
    }
}

impl RuleSource for StaticRuleSource {
    fn fingerprint(&self) -> Option<SystemTime> {
        Some(self.inner.lock().1)
    }

    fn load(&self) -> Result<Rules, LocationError> {
        Ok(self.inner.lock().0.clone())
    }

    fn describe(&self) -> String {
        "static rules".to_string()
    }
}

impl<T: RuleSource + ?Sized> RuleSource for Arc<T> {
    fn fingerprint(&self) -> Option<SystemTime> {
        (**self).fingerprint()
    }

    fn load(&self) -> Result<Rules, LocationError> {
        (**self).load()
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}
