use crate::{config::Config, converter::Strategy};
use serde::{Deserialize, Serialize};

/// Which strategies a render may try. Order is never taken from here: the
/// chain always runs embedded, subprocess, browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RenderPolicy {
    pub eligible: Vec<Strategy>,
}

impl RenderPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self::only(&cfg.chain.strategies)
    }

    pub fn all() -> Self {
        Self::only(&Strategy::ALL)
    }

    pub fn only(strategies: &[Strategy]) -> Self {
        let mut eligible = strategies.to_vec();
        eligible.sort();
        eligible.dedup();
        Self { eligible }
    }

    /// Passthrough only.
    pub fn none() -> Self {
        Self {
            eligible: Vec::new(),
        }
    }

    pub fn allows(&self, strategy: Strategy) -> bool {
        self.eligible.contains(&strategy)
    }
}

impl Default for RenderPolicy {
    fn default() -> Self {
        Self::all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_sorts_and_dedups() {
        let p = RenderPolicy::only(&[Strategy::Browser, Strategy::Embedded, Strategy::Browser]);
        assert_eq!(p.eligible, vec![Strategy::Embedded, Strategy::Browser]);
        assert!(!p.allows(Strategy::Subprocess));
    }

    #[test]
    fn none_allows_nothing() {
        assert!(Strategy::ALL.iter().all(|s| !RenderPolicy::none().allows(*s)));
    }
}
