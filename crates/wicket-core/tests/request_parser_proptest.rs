use proptest::prelude::*;
use wicket_core::{parse_request_line, RequestParseError};

fn host_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("[a-z0-9](?:[a-z0-9.-]{0,30}[a-z0-9])?")
        .expect("valid hostname regex")
}

fn path_strategy() -> impl Strategy<Value = String> {
    proptest::string::string_regex("/[a-zA-Z0-9_./?&=%-]{0,40}").expect("valid path regex")
}

proptest! {
    #[test]
    fn accepts_absolute_urls_with_explicit_port(
        host in host_strategy(),
        port in 1_u16..=u16::MAX,
        path in path_strategy(),
    ) {
        let line = format!("GET http://{host}:{port}{path} HTTP/1.0");
        let request = parse_request_line(&line)
            .expect("canonical absolute-form request line must parse");
        prop_assert_eq!(request.host, host);
        prop_assert_eq!(request.port, port);
        prop_assert_eq!(request.path, path);
        prop_assert!(!request.is_connect);
    }

    #[test]
    fn defaults_port_80_when_the_url_names_none(host in host_strategy(), path in path_strategy()) {
        let line = format!("GET http://{host}{path} HTTP/1.0");
        let request = parse_request_line(&line).expect("port-free URL must parse");
        prop_assert_eq!(request.port, 80);
        prop_assert_eq!(request.path, path);
    }

    #[test]
    fn accepts_connect_authority_form(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("CONNECT {host}:{port} HTTP/1.0");
        let request = parse_request_line(&line).expect("CONNECT authority form must parse");
        prop_assert!(request.is_connect);
        prop_assert_eq!(request.host, host);
        prop_assert_eq!(request.port, port);
    }

    #[test]
    fn rejects_connect_spelled_in_lowercase(host in host_strategy(), port in 1_u16..=u16::MAX) {
        let line = format!("connect {host}:{port} HTTP/1.0");
        let error = parse_request_line(&line).expect_err("method comparison is case-sensitive");
        prop_assert_eq!(error, RequestParseError::UnknownUrlType);
    }

    #[test]
    fn rejects_non_numeric_ports(host in host_strategy(), port in "[a-z]{1,6}") {
        let line = format!("GET http://{host}:{port}/ HTTP/1.0");
        let error = parse_request_line(&line).expect_err("textual port must fail");
        prop_assert_eq!(error, RequestParseError::InvalidHttpUrl);
    }

    #[test]
    fn never_panics_on_arbitrary_lines(line in "\\PC{0,200}") {
        let _ = parse_request_line(&line);
    }
}
