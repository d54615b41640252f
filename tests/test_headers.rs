use h3mux::error::Error;
use h3mux::qpack::{
    decode_field_section, encode_field_section, parse_status, request_fields, response_fields,
    trailer_fields,
};
use h3mux::types::Header;

fn names(fields: &[Header]) -> Vec<&str> {
    fields.iter().map(|h| h.name.as_str()).collect()
}

#[test]
fn field_section_roundtrip() {
    let fields = vec![
        Header::new(":method", "GET"),
        Header::new(":scheme", "https"),
        Header::new(":authority", "example.com:443"),
        Header::new(":path", "/index.html"),
        Header::new("user-agent", "h3mux-test"),
        Header::new("x-empty", ""),
    ];
    let encoded = encode_field_section(&fields).unwrap();
    let decoded = decode_field_section(&encoded).unwrap();
    assert_eq!(decoded, fields);
}

#[test]
fn request_fields_put_pseudo_headers_first_in_fixed_order() {
    // Deliberately shuffled pseudo-header input.
    let pseudo = vec![
        Header::new(":path", "/f"),
        Header::new(":method", "GET"),
        Header::new(":authority", "h:443"),
        Header::new(":scheme", "https"),
    ];
    let headers = vec![Header::new("X-Custom", "1")];
    let fields = request_fields(&pseudo, &headers);
    assert_eq!(
        names(&fields),
        vec![":method", ":scheme", ":authority", ":path", "x-custom"]
    );
}

#[test]
fn request_fields_merge_cookies() {
    let pseudo = vec![Header::new(":method", "GET")];
    let headers = vec![
        Header::new("Cookie", "a=1"),
        Header::new("accept", "*/*"),
        Header::new("cookie", "b=2"),
    ];
    let fields = request_fields(&pseudo, &headers);
    assert_eq!(names(&fields), vec![":method", "accept", "cookie"]);
    let cookie = fields.iter().find(|h| h.name == "cookie").unwrap();
    assert_eq!(cookie.value_str(), "a=1; b=2");
}

#[test]
fn request_fields_lowercase_user_headers() {
    let fields = request_fields(
        &[Header::new(":method", "GET")],
        &[Header::new("X-Mixed-Case", "v")],
    );
    assert!(fields.iter().any(|h| h.name == "x-mixed-case"));
}

#[test]
fn response_fields_put_status_first() {
    let fields = response_fields(204, &[Header::new("Server", "h3mux")]);
    assert_eq!(names(&fields), vec![":status", "server"]);
    assert_eq!(fields[0].value_str(), "204");
}

#[test]
fn trailer_fields_drop_pseudo_headers() {
    let fields = trailer_fields(&[
        Header::new(":status", "200"),
        Header::new("Foo", "1"),
    ]);
    assert_eq!(names(&fields), vec!["foo"]);
}

#[test]
fn parse_status_accepts_the_full_valid_range() {
    for (raw, want) in [("100", 100u16), ("200", 200), ("404", 404), ("999", 999)] {
        let fields = vec![Header::new(":status", raw)];
        assert_eq!(parse_status(&fields).unwrap(), want);
    }
}

#[test]
fn parse_status_rejects_malformed_values() {
    for raw in ["", "abc", "99", "1000", "-1", "20a"] {
        let fields = vec![Header::new(":status", raw)];
        match parse_status(&fields) {
            Err(Error::Message(msg)) => {
                assert_eq!(msg, "invalid or missing :status header");
            }
            other => panic!("expected Message error for {:?}, got {:?}", raw, other),
        }
    }
}

#[test]
fn parse_status_requires_the_header() {
    let fields = vec![Header::new("content-type", "text/plain")];
    assert!(matches!(parse_status(&fields), Err(Error::Message(_))));
}
