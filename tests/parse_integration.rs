use skiff::parse;
use skiff::profile::AuthMethodKind;

#[test]
fn test_parse_remote_host_with_port() {
    let (u, h, p) = parse::parse_remote_host("root@example.com:2222").unwrap();
    assert_eq!(u, "root");
    assert_eq!(h, "example.com");
    assert_eq!(p, 2222);
}

#[test]
fn test_parse_remote_host_default_port() {
    let (u, h, p) = parse::parse_remote_host("user@host").unwrap();
    assert_eq!(u, "user");
    assert_eq!(h, "host");
    assert_eq!(p, 22);
}

#[test]
fn test_parse_remote_host_ipv6() {
    let (u, h, p) = parse::parse_remote_host("ops@[fe80::1]:2200").unwrap();
    assert_eq!((u.as_str(), h.as_str(), p), ("ops", "fe80::1", 2200));
    let (_, h, p) = parse::parse_remote_host("ops@[::1]").unwrap();
    assert_eq!((h.as_str(), p), ("::1", 22));
}

#[test]
fn test_parse_remote_host_errors() {
    assert!(parse::parse_remote_host("example.com").is_err());
    assert!(parse::parse_remote_host("@example.com").is_err());
    assert!(parse::parse_remote_host("u@host:notaport").is_err());
    assert!(parse::parse_remote_host("u@[::1").is_err());
}

#[test]
fn test_parse_auth_order() {
    let order = parse::parse_auth_order("password, key,agent").unwrap();
    assert_eq!(order, vec![AuthMethodKind::Password, AuthMethodKind::PrivateKey, AuthMethodKind::Agent]);
    assert!(parse::parse_auth_order("key,kerberos").is_err());
    assert!(parse::parse_auth_order("").unwrap().is_empty());
}
