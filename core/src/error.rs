/// Error taxonomy of a probe module run.
///
/// Not-applicable and missing-privilege outcomes are expected conditions and
/// do not poison dependents; only `Failure` marks a probe that should have
/// worked.
#[derive(Debug, thiserror::Error)]
pub enum ModuleError {
    #[error("not applicable: {0}")]
    NotApplicable(String),
    #[error("missing privilege: {0}")]
    MissingPrivilege(String),
    #[error(transparent)]
    Failure(#[from] anyhow::Error),
}

impl ModuleError {
    pub fn not_applicable(msg: impl Into<String>) -> Self {
        ModuleError::NotApplicable(msg.into())
    }

    pub fn missing_privilege(msg: impl Into<String>) -> Self {
        ModuleError::MissingPrivilege(msg.into())
    }
}

/// Joins per-target errors collected at a fan-out boundary into a single
/// error, so the payload carries at most one entry per module per scan.
pub fn join_errors(errors: Vec<anyhow::Error>) -> Option<anyhow::Error> {
    if errors.is_empty() {
        return None;
    }
    let joined = errors
        .iter()
        .map(|e| format!("{e:#}"))
        .collect::<Vec<_>>()
        .join("; ");
    Some(anyhow::anyhow!("{} target(s) failed: {joined}", errors.len()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_none_on_empty() {
        assert!(join_errors(vec![]).is_none());
    }

    #[test]
    fn join_concatenates_messages() {
        let err = join_errors(vec![
            anyhow::anyhow!("10.0.0.4: timeout"),
            anyhow::anyhow!("10.0.0.9: connection refused"),
        ])
        .unwrap();
        let msg = format!("{err}");
        assert!(msg.contains("2 target(s) failed"));
        assert!(msg.contains("timeout"));
        assert!(msg.contains("connection refused"));
    }
}
