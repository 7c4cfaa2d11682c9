use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One way of proving identity to the server.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethodKind {
    Agent,
    PrivateKey,
    Password,
}

impl std::fmt::Display for AuthMethodKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            AuthMethodKind::Agent => "agent",
            AuthMethodKind::PrivateKey => "private-key",
            AuthMethodKind::Password => "password",
        })
    }
}

impl std::str::FromStr for AuthMethodKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "agent" => Ok(AuthMethodKind::Agent),
            "key" | "private-key" | "privatekey" | "publickey" => Ok(AuthMethodKind::PrivateKey),
            "password" | "pass" => Ok(AuthMethodKind::Password),
            other => Err(format!("unknown auth method: {other}")),
        }
    }
}

/// Ordered, duplicate-free list over every [`AuthMethodKind`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationOrder(Vec<AuthMethodKind>);

impl AuthenticationOrder {
    /// Fallback order appended after the caller's explicit preferences.
    pub const FALLBACK: [AuthMethodKind; 3] =
        [AuthMethodKind::Agent, AuthMethodKind::PrivateKey, AuthMethodKind::Password];

    /// Dedupe `given` keeping first occurrences, then append the methods it
    /// does not mention in [`Self::FALLBACK`] order.
    pub fn normalize(given: &[AuthMethodKind]) -> Self {
        let mut out: Vec<AuthMethodKind> = Vec::with_capacity(3);
        for m in given.iter().chain(Self::FALLBACK.iter()) {
            if !out.contains(m) {
                out.push(*m);
            }
        }
        Self(out)
    }

    /// Profiles that only stored a single preferred method.
    pub fn from_legacy(primary: AuthMethodKind) -> Self {
        Self::normalize(&[primary])
    }

    pub fn methods(&self) -> &[AuthMethodKind] {
        &self.0
    }
}

impl Default for AuthenticationOrder {
    fn default() -> Self {
        Self::normalize(&[])
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectStrategy {
    #[default]
    None,
    FixedInterval,
}

/// Connection parameters for one remote host. Credentials live here only for
/// the duration of a session; persisting them is the caller's business.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionProfile {
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth_order: Vec<AuthMethodKind>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default, skip_serializing)]
    pub key_passphrase: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    pub timeout_secs: u64,
    pub keepalive_secs: u64,
    #[serde(default)]
    pub reconnect_strategy: ReconnectStrategy,
    #[serde(default)]
    pub reconnect_attempts: u32,
    #[serde(default)]
    pub reconnect_delay_secs: u64,
}

impl ConnectionProfile {
    pub fn new(host: impl Into<String>, port: u16, username: impl Into<String>) -> Self {
        let host = host.into();
        let username = username.into();
        Self {
            name: format!("{}@{}", username, host),
            host,
            port,
            username,
            auth_order: Vec::new(),
            private_key_path: None,
            key_passphrase: None,
            password: None,
            timeout_secs: 30,
            keepalive_secs: 30,
            reconnect_strategy: ReconnectStrategy::FixedInterval,
            reconnect_attempts: 3,
            reconnect_delay_secs: 2,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn authentication_order(&self) -> AuthenticationOrder {
        AuthenticationOrder::normalize(&self.auth_order)
    }
}

impl std::fmt::Debug for ConnectionProfile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProfile")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_order", &self.auth_order)
            .field("private_key_path", &self.private_key_path)
            .field("key_passphrase", &self.key_passphrase.as_ref().map(|_| "<redacted>"))
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_secs", &self.timeout_secs)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("reconnect_strategy", &self.reconnect_strategy)
            .field("reconnect_attempts", &self.reconnect_attempts)
            .field("reconnect_delay_secs", &self.reconnect_delay_secs)
            .finish()
    }
}

/// Timeout/keepalive/reconnect parameters bound to one connection's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResiliencePolicy {
    pub timeout_secs: u64,
    pub keepalive_secs: u64,
    pub strategy: ReconnectStrategy,
    pub reconnect_attempts: u32,
    pub reconnect_delay_secs: u64,
}

impl ResiliencePolicy {
    pub fn from_profile(p: &ConnectionProfile) -> Self {
        let (reconnect_attempts, reconnect_delay_secs) = match p.reconnect_strategy {
            ReconnectStrategy::None => (0, 0),
            ReconnectStrategy::FixedInterval => {
                (p.reconnect_attempts.clamp(1, 10), p.reconnect_delay_secs.clamp(1, 30))
            }
        };
        Self {
            timeout_secs: p.timeout_secs.clamp(3, 300),
            keepalive_secs: p.keepalive_secs.min(300),
            strategy: p.reconnect_strategy,
            reconnect_attempts,
            reconnect_delay_secs,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn reconnect_enabled(&self) -> bool {
        self.strategy == ReconnectStrategy::FixedInterval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_clamps_ranges() {
        let mut p = ConnectionProfile::new("h", 22, "u");
        p.timeout_secs = 1;
        p.keepalive_secs = 1000;
        p.reconnect_attempts = 50;
        p.reconnect_delay_secs = 0;
        let pol = ResiliencePolicy::from_profile(&p);
        assert_eq!(pol.timeout_secs, 3);
        assert_eq!(pol.keepalive_secs, 300);
        assert_eq!(pol.reconnect_attempts, 10);
        assert_eq!(pol.reconnect_delay_secs, 1);
    }

    #[test]
    fn no_strategy_zeroes_reconnect() {
        let mut p = ConnectionProfile::new("h", 22, "u");
        p.reconnect_strategy = ReconnectStrategy::None;
        p.reconnect_attempts = 5;
        p.reconnect_delay_secs = 5;
        let pol = ResiliencePolicy::from_profile(&p);
        assert_eq!(pol.reconnect_attempts, 0);
        assert_eq!(pol.reconnect_delay_secs, 0);
        assert!(!pol.reconnect_enabled());
    }

    #[test]
    fn auth_order_normalizes() {
        use AuthMethodKind::*;
        let o = AuthenticationOrder::normalize(&[Password, Password, Agent]);
        assert_eq!(o.methods(), &[Password, Agent, PrivateKey]);
        assert_eq!(AuthenticationOrder::default().methods(), &[Agent, PrivateKey, Password]);
        assert_eq!(AuthenticationOrder::from_legacy(PrivateKey).methods(), &[
            PrivateKey, Agent, Password
        ]);
    }

    #[test]
    fn debug_redacts_secrets() {
        let mut p = ConnectionProfile::new("h", 22, "u");
        p.password = Some("hunter2".into());
        p.key_passphrase = Some("sesame".into());
        let s = format!("{:?}", p);
        assert!(!s.contains("hunter2"));
        assert!(!s.contains("sesame"));
    }

    #[test]
    fn parse_method_names() {
        assert_eq!("key".parse::<AuthMethodKind>(), Ok(AuthMethodKind::PrivateKey));
        assert!("kerberos".parse::<AuthMethodKind>().is_err());
    }
}
