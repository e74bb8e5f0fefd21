use std::time::Duration;

/// Per-call knobs for `rpc_call`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// How long to wait for the reply.
    ///
    /// If left unspecified, the client falls back to the method's route default and then to
    /// the settings-level default timeout.
    pub timeout: Option<Duration>,
    /// If `true`, the request expires in the broker after the timeout, so a server catching
    /// up with its backlog does not process calls nobody waits for anymore.
    pub expiration: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            timeout: None,
            expiration: true,
        }
    }
}

impl CallOptions {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn expiration(mut self, expiration: bool) -> Self {
        self.expiration = expiration;
        self
    }
}
