//! Listener ports.
//!
//! | Port | Purpose |
//! |------|---------|
//! | 9999 | gRPC traffic (mocked or relayed) |
//! | 9998 | Health, readiness, metrics and the control API |
//!
//! `--bind` on the command line takes precedence over `MOCKGATE_PROXY_PORT`.

/// Default gRPC listener port.
pub const DEFAULT_PROXY_PORT: u16 = 9999;

/// Default admin port.
pub const DEFAULT_ADMIN_PORT: u16 = 9998;

/// gRPC listener port from `MOCKGATE_PROXY_PORT`, or the default.
pub fn proxy_port() -> u16 {
    std::env::var("MOCKGATE_PROXY_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_PROXY_PORT)
}

/// Admin port from `MOCKGATE_ADMIN_PORT`, or the default.
pub fn admin_port() -> u16 {
    std::env::var("MOCKGATE_ADMIN_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_ADMIN_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_ports_differ() {
        assert_ne!(DEFAULT_PROXY_PORT, DEFAULT_ADMIN_PORT);
    }

    #[test]
    fn test_admin_port_from_env() {
        unsafe {
            std::env::set_var("MOCKGATE_ADMIN_PORT", "9100");
        }
        assert_eq!(admin_port(), 9100);

        unsafe {
            std::env::set_var("MOCKGATE_ADMIN_PORT", "not_a_port");
        }
        assert_eq!(admin_port(), DEFAULT_ADMIN_PORT);

        unsafe {
            std::env::remove_var("MOCKGATE_ADMIN_PORT");
        }
    }

    #[test]
    fn test_proxy_port_is_valid() {
        assert!(proxy_port() > 0);
    }
}
