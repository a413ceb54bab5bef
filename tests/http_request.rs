use evloop::http::{HttpRequest, Method, Version};
use evloop::Timestamp;

#[test]
fn known_methods_parse_and_render() {
    for (token, method) in [
        ("GET", Method::Get),
        ("POST", Method::Post),
        ("HEAD", Method::Head),
        ("PUT", Method::Put),
        ("DELETE", Method::Delete),
    ] {
        let mut request = HttpRequest::new();
        assert!(request.set_method(token));
        assert_eq!(request.method(), method);
        assert_eq!(request.method().as_str(), token);
    }
}

#[test]
fn unknown_and_lowercase_methods_are_rejected() {
    let mut request = HttpRequest::new();
    assert!(!request.set_method("get"));
    assert_eq!(request.method(), Method::Invalid);
    assert_eq!(request.method().as_str(), "UNKNOWN");

    let mut request = HttpRequest::new();
    assert!(!request.set_method("PATCH"));
    assert_eq!(request.method(), Method::Invalid);
}

#[test]
fn version_defaults_to_unknown() {
    let mut request = HttpRequest::new();
    assert_eq!(request.version(), Version::Unknown);
    request.set_version(Version::Http11);
    assert_eq!(request.version(), Version::Http11);
}

#[test]
fn header_values_are_trimmed() {
    let mut request = HttpRequest::new();
    request.add_header("Host", "  example.com\t ");
    assert_eq!(request.get_header("Host"), Some("example.com"));

    request.add_header("User-Agent", " spaced out agent ");
    assert_eq!(request.get_header("User-Agent"), Some("spaced out agent"));
}

#[test]
fn header_names_are_case_sensitive_and_last_write_wins() {
    let mut request = HttpRequest::new();
    request.add_header("Accept", "text/html");
    request.add_header("accept", "application/json");
    assert_eq!(request.get_header("Accept"), Some("text/html"));
    assert_eq!(request.get_header("accept"), Some("application/json"));

    request.add_header("Accept", "text/plain");
    assert_eq!(request.get_header("Accept"), Some("text/plain"));
    assert_eq!(request.headers().len(), 2);
}

#[test]
fn path_query_and_receive_time_round_trip() {
    let mut request = HttpRequest::new();
    request.set_path("/index.html");
    request.set_query("a=1&b=2");
    let stamp = Timestamp::now();
    request.set_receive_time(stamp);

    assert_eq!(request.path(), "/index.html");
    assert_eq!(request.query(), "a=1&b=2");
    assert_eq!(request.receive_time(), stamp);
    assert!(request.get_header("Missing").is_none());
}
