//! Named diagnosis depths and their resolution to concrete settings.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use crate::config::{Config, ProfileSettings};
use crate::errors::DiagnosisError;
use crate::model::{CheckPriority, CheckType, DiagnosisProfile};

/// Static definition of one profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileDefinition {
    /// Ignored for `custom`, whose checks come from the caller
    pub checks: Vec<CheckType>,
    pub timeout_secs: u64,
    pub log_depth: usize,
    pub parallel: bool,
    pub use_cache: bool,
    pub cache_ttl_secs: u64,
}

/// Profile settings ready for one diagnosis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedProfile {
    pub profile: DiagnosisProfile,
    pub checks: Vec<CheckType>,
    pub timeout: Duration,
    pub log_depth: usize,
    pub parallel: bool,
    pub use_cache: bool,
    pub cache_ttl: Duration,
}

/// Immutable table of the four profiles, built once at startup.
#[derive(Debug, Clone)]
pub struct ProfileTable {
    profiles: HashMap<DiagnosisProfile, ProfileDefinition>,
}

fn checks_up_to(max: CheckPriority) -> Vec<CheckType> {
    let allowed: &[CheckPriority] = match max {
        CheckPriority::Critical => &[CheckPriority::Critical],
        CheckPriority::High => &[CheckPriority::Critical, CheckPriority::High],
        CheckPriority::Medium => &[
            CheckPriority::Critical,
            CheckPriority::High,
            CheckPriority::Medium,
        ],
        CheckPriority::Low => return CheckType::ALL.to_vec(),
    };
    CheckType::ALL
        .iter()
        .copied()
        .filter(|c| allowed.contains(&c.default_priority()))
        .collect()
}

impl ProfileTable {
    pub fn defaults() -> Self {
        let mut profiles = HashMap::new();
        profiles.insert(
            DiagnosisProfile::Full,
            ProfileDefinition {
                checks: CheckType::ALL.to_vec(),
                timeout_secs: 120,
                log_depth: 500,
                parallel: true,
                use_cache: false,
                cache_ttl_secs: 0,
            },
        );
        profiles.insert(
            DiagnosisProfile::Light,
            ProfileDefinition {
                checks: checks_up_to(CheckPriority::High),
                timeout_secs: 60,
                log_depth: 200,
                parallel: true,
                use_cache: true,
                cache_ttl_secs: 300,
            },
        );
        profiles.insert(
            DiagnosisProfile::Quick,
            ProfileDefinition {
                checks: vec![CheckType::HttpAvailability, CheckType::DatabaseConnection],
                timeout_secs: 30,
                log_depth: 50,
                parallel: true,
                use_cache: true,
                cache_ttl_secs: 60,
            },
        );
        profiles.insert(
            DiagnosisProfile::Custom,
            ProfileDefinition {
                checks: Vec::new(),
                timeout_secs: 90,
                log_depth: 200,
                parallel: true,
                use_cache: false,
                cache_ttl_secs: 0,
            },
        );
        Self { profiles }
    }

    /// Defaults with the `[profiles.*]` overrides applied. Profile names
    /// were validated by `Config::validate`; unknown keys are skipped.
    pub fn from_config(config: &Config) -> Self {
        let mut table = Self::defaults();
        for (name, overrides) in &config.profiles {
            if let Ok(profile) = DiagnosisProfile::from_str(name) {
                if let Some(def) = table.profiles.get_mut(&profile) {
                    apply_overrides(def, overrides, profile);
                }
            }
        }
        table
    }

    pub fn definition(&self, profile: DiagnosisProfile) -> Option<&ProfileDefinition> {
        self.profiles.get(&profile)
    }

    /// Resolve a profile by name. Unknown names are an error.
    pub fn resolve(
        &self,
        name: &str,
        custom_checks: Option<&[CheckType]>,
    ) -> Result<ResolvedProfile, DiagnosisError> {
        self.resolve_profile(DiagnosisProfile::from_str(name)?, custom_checks)
    }

    pub fn resolve_profile(
        &self,
        profile: DiagnosisProfile,
        custom_checks: Option<&[CheckType]>,
    ) -> Result<ResolvedProfile, DiagnosisError> {
        let def = self
            .profiles
            .get(&profile)
            .ok_or_else(|| DiagnosisError::UnknownProfile(profile.to_string()))?;

        let checks = if profile == DiagnosisProfile::Custom {
            match custom_checks {
                Some(checks) if !checks.is_empty() => checks.to_vec(),
                _ => return Err(DiagnosisError::EmptyCustomProfile),
            }
        } else {
            def.checks.clone()
        };

        Ok(ResolvedProfile {
            profile,
            checks,
            timeout: Duration::from_secs(def.timeout_secs),
            log_depth: def.log_depth,
            parallel: def.parallel,
            use_cache: def.use_cache && def.cache_ttl_secs > 0,
            cache_ttl: Duration::from_secs(def.cache_ttl_secs),
        })
    }
}

fn apply_overrides(def: &mut ProfileDefinition, o: &ProfileSettings, profile: DiagnosisProfile) {
    if let Some(checks) = &o.checks {
        if profile != DiagnosisProfile::Custom {
            def.checks = checks.clone();
        }
    }
    if let Some(t) = o.timeout_secs {
        def.timeout_secs = t;
    }
    if let Some(d) = o.log_depth {
        def.log_depth = d;
    }
    if let Some(p) = o.parallel {
        def.parallel = p;
    }
    if let Some(c) = o.use_cache {
        def.use_cache = c;
    }
    if let Some(ttl) = o.cache_ttl_secs {
        def.cache_ttl_secs = ttl;
    }
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profiles() {
        let table = ProfileTable::defaults();

        let full = table.resolve("full", None).unwrap();
        assert_eq!(full.checks.len(), CheckType::ALL.len());
        assert!(!full.use_cache);
        assert_eq!(full.timeout, Duration::from_secs(120));

        let light = table.resolve("light", None).unwrap();
        assert!(light.use_cache);
        assert_eq!(light.cache_ttl, Duration::from_secs(300));
        assert!(light
            .checks
            .iter()
            .all(|c| matches!(c.default_priority(), CheckPriority::Critical | CheckPriority::High)));
        assert_eq!(light.checks.len(), 5);

        let quick = table.resolve("quick", None).unwrap();
        assert_eq!(
            quick.checks,
            vec![CheckType::HttpAvailability, CheckType::DatabaseConnection]
        );
        assert_eq!(quick.cache_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_unknown_profile_is_error() {
        let table = ProfileTable::defaults();
        assert!(matches!(
            table.resolve("exhaustive", None),
            Err(DiagnosisError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_custom_uses_caller_checks() {
        let table = ProfileTable::defaults();
        let custom = table
            .resolve("custom", Some(&[CheckType::SslCertificate]))
            .unwrap();
        assert_eq!(custom.checks, vec![CheckType::SslCertificate]);
        assert!(!custom.use_cache);

        assert!(matches!(
            table.resolve("custom", None),
            Err(DiagnosisError::EmptyCustomProfile)
        ));
        assert!(matches!(
            table.resolve("custom", Some(&[])),
            Err(DiagnosisError::EmptyCustomProfile)
        ));
    }

    #[test]
    fn test_non_custom_ignores_caller_checks() {
        let table = ProfileTable::defaults();
        let quick = table
            .resolve("quick", Some(&[CheckType::CoreUpdates]))
            .unwrap();
        assert_eq!(quick.checks.len(), 2);
    }

    #[test]
    fn test_config_overrides() {
        let config = Config::from_toml_str(
            r#"
            [profiles.light]
            cache_ttl_secs = 0
            timeout_secs = 15

            [profiles.full]
            checks = ["http_availability"]
            "#,
        )
        .unwrap();
        let table = ProfileTable::from_config(&config);

        let light = table.resolve("light", None).unwrap();
        assert!(!light.use_cache);
        assert_eq!(light.timeout, Duration::from_secs(15));

        let full = table.resolve("full", None).unwrap();
        assert_eq!(full.checks, vec![CheckType::HttpAvailability]);
    }
}
