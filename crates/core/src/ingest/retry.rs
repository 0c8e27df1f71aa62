//! Retry policy for failed remote jobs.

use super::ParameterSet;
use crate::sizing::MachineCatalog;

/// Classification of a failed job's exit code before any retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    /// Failed state with a zero exit code. Never retried.
    Inconsistent,
    /// Non-zero or missing exit code.
    Failure(Option<i32>),
}

impl ExitClass {
    pub fn classify(exit_code: Option<i32>) -> Self {
        match exit_code {
            Some(0) => ExitClass::Inconsistent,
            other => ExitClass::Failure(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Resubmit with these escalated parameters.
    Retry { params: ParameterSet },
    Fail { reason: RetryRefusal },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryRefusal {
    NotRetryable(i32),
    NoExitCode,
    NoEscalationTier,
    AttemptsExhausted,
}

impl RetryRefusal {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryRefusal::NotRetryable(_) => "not_retryable",
            RetryRefusal::NoExitCode => "no_exit_code",
            RetryRefusal::NoEscalationTier => "no_escalation_tier",
            RetryRefusal::AttemptsExhausted => "attempts_exhausted",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    retryable_codes: Vec<i32>,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(retryable_codes: Vec<i32>, max_attempts: u32) -> Self {
        Self {
            retryable_codes,
            max_attempts,
        }
    }

    pub fn retryable_codes(&self) -> &[i32] {
        &self.retryable_codes
    }

    pub fn is_retryable(&self, exit_code: i32) -> bool {
        exit_code != 0 && self.retryable_codes.contains(&exit_code)
    }

    /// Retry only on an out-of-memory exit code with a larger tier available.
    pub fn decide(
        &self,
        exit_code: Option<i32>,
        attempt: u32,
        params: &ParameterSet,
        catalog: &MachineCatalog,
    ) -> RetryDecision {
        let Some(code) = exit_code else {
            return RetryDecision::Fail {
                reason: RetryRefusal::NoExitCode,
            };
        };
        if !self.is_retryable(code) {
            return RetryDecision::Fail {
                reason: RetryRefusal::NotRetryable(code),
            };
        }
        if attempt >= self.max_attempts {
            return RetryDecision::Fail {
                reason: RetryRefusal::AttemptsExhausted,
            };
        }
        match params.escalated(catalog) {
            Some(params) => RetryDecision::Retry { params },
            None => RetryDecision::Fail {
                reason: RetryRefusal::NoEscalationTier,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(vec![137, 139], 5)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::params::{ClusterParams, JobParams};

    fn params(machine_type: &str, catalog: &MachineCatalog) -> ParameterSet {
        ParameterSet::new(
            JobParams::IngestCluster(ClusterParams {
                cluster_file: "gs://fc-1234/cluster.txt".to_string(),
                name: "UMAP".to_string(),
                machine_type: machine_type.to_string(),
            }),
            catalog,
        )
        .unwrap()
    }

    #[test]
    fn test_oom_codes_escalate() {
        let catalog = MachineCatalog::up_to("n2d-highmem-16").unwrap();
        let policy = RetryPolicy::default();
        let set = params("n2d-highmem-4", &catalog);

        for code in [137, 139] {
            match policy.decide(Some(code), 1, &set, &catalog) {
                RetryDecision::Retry { params } => {
                    assert_eq!(params.machine_type(), "n2d-highmem-8")
                }
                other => panic!("expected retry for {}, got {:?}", code, other),
            }
        }
    }

    #[test]
    fn test_generic_failure_is_terminal() {
        let catalog = MachineCatalog::full();
        let policy = RetryPolicy::default();
        let set = params("n2d-highmem-4", &catalog);

        assert_eq!(
            policy.decide(Some(1), 1, &set, &catalog),
            RetryDecision::Fail {
                reason: RetryRefusal::NotRetryable(1)
            }
        );
    }

    #[test]
    fn test_zero_is_never_retryable() {
        let policy = RetryPolicy::new(vec![0, 137], 5);
        assert!(!policy.is_retryable(0));
        assert_eq!(ExitClass::classify(Some(0)), ExitClass::Inconsistent);
        assert_eq!(ExitClass::classify(Some(137)), ExitClass::Failure(Some(137)));
        assert_eq!(ExitClass::classify(None), ExitClass::Failure(None));
    }

    #[test]
    fn test_no_escalation_tier() {
        let catalog = MachineCatalog::up_to("n2d-highmem-16").unwrap();
        let policy = RetryPolicy::default();
        let set = params("n2d-highmem-16", &catalog);

        assert_eq!(
            policy.decide(Some(137), 1, &set, &catalog),
            RetryDecision::Fail {
                reason: RetryRefusal::NoEscalationTier
            }
        );
    }

    #[test]
    fn test_attempt_cap() {
        let catalog = MachineCatalog::full();
        let policy = RetryPolicy::new(vec![137], 2);
        let set = params("n2d-highmem-4", &catalog);

        assert!(matches!(
            policy.decide(Some(137), 2, &set, &catalog),
            RetryDecision::Fail {
                reason: RetryRefusal::AttemptsExhausted
            }
        ));
    }

    #[test]
    fn test_missing_exit_code() {
        let catalog = MachineCatalog::full();
        let set = params("n2d-highmem-4", &catalog);
        assert_eq!(
            RetryPolicy::default().decide(None, 1, &set, &catalog),
            RetryDecision::Fail {
                reason: RetryRefusal::NoExitCode
            }
        );
    }
}
