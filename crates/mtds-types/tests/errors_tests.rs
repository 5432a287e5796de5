use mtds_types::*;

#[test]
fn error_constructors_and_classes() {
    let e = MtdsError::config("bad");
    assert!(e.is_fatal());
    assert!(!e.is_retryable());

    let e = MtdsError::resource_exhausted("pool full");
    assert!(e.is_retryable());
    assert!(!e.is_fatal());

    let e = MtdsError::already_exists("put in flight");
    assert!(e.is_retryable());
}

#[test]
fn error_conversions() {
    let io_err: MtdsError = std::io::Error::new(std::io::ErrorKind::Other, "io").into();
    match io_err {
        MtdsError::IO { .. } => {}
        _ => panic!("wrong kind"),
    }

    let ser_err: MtdsError = serde_json::from_str::<serde_json::Value>("{")
        .unwrap_err()
        .into();
    match ser_err {
        MtdsError::Serialization { .. } => {}
        _ => panic!("wrong kind"),
    }
}
