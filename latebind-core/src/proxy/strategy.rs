use std::fmt;

/// How long a client instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lifetime {
    /// A fresh instance is opened for every call and closed right after.
    PerCall,
    /// One instance serves every call until the proxy is closed.
    #[default]
    PerSession,
}

/// What happens to faults raised while opening or calling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FailurePolicy {
    /// Faults are returned to the caller.
    #[default]
    Throwable,
    /// Faults are reported as events and recorded on the proxy instead.
    Unthrowable,
}

/// One of the four ways a proxy can be built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Strategy {
    pub lifetime: Lifetime,
    pub policy: FailurePolicy,
}

impl Strategy {
    pub const fn new(lifetime: Lifetime, policy: FailurePolicy) -> Self {
        Self { lifetime, policy }
    }

    pub const fn per_session() -> Self {
        Self::new(Lifetime::PerSession, FailurePolicy::Throwable)
    }

    pub const fn per_call() -> Self {
        Self::new(Lifetime::PerCall, FailurePolicy::Throwable)
    }

    pub const fn unthrowable(self) -> Self {
        Self::new(self.lifetime, FailurePolicy::Unthrowable)
    }

    pub fn is_per_call(&self) -> bool {
        self.lifetime == Lifetime::PerCall
    }

    pub fn is_unthrowable(&self) -> bool {
        self.policy == FailurePolicy::Unthrowable
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lifetime = match self.lifetime {
            Lifetime::PerCall => "per-call",
            Lifetime::PerSession => "per-session",
        };
        let policy = match self.policy {
            FailurePolicy::Throwable => "throwable",
            FailurePolicy::Unthrowable => "unthrowable",
        };
        write!(f, "{lifetime}/{policy}")
    }
}
