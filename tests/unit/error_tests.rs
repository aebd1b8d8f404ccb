use pipelink::AppError;

#[test]
fn display_prefixes_category() {
    assert_eq!(AppError::Config("bad".into()).to_string(), "config: bad");
    assert_eq!(AppError::Decode("x".into()).to_string(), "decode: x");
    assert_eq!(AppError::Routing("x".into()).to_string(), "routing: x");
    assert_eq!(AppError::Handler("x".into()).to_string(), "handler: x");
    assert_eq!(AppError::Process("x".into()).to_string(), "process: x");
    assert_eq!(AppError::Transport("x".into()).to_string(), "transport: x");
    assert_eq!(AppError::Timeout("x".into()).to_string(), "timeout: x");
    assert_eq!(AppError::Io("x".into()).to_string(), "io: x");
}

#[test]
fn json_errors_become_decode_errors() {
    let err: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("malformed")
        .into();
    assert!(matches!(&err, AppError::Decode(msg) if msg.starts_with("malformed json")));
}

#[test]
fn toml_errors_become_config_errors() {
    let err: AppError = toml::from_str::<toml::Value>("= nope")
        .expect_err("malformed")
        .into();
    assert!(matches!(err, AppError::Config(_)));
}

#[test]
fn io_errors_become_io_errors() {
    let err: AppError = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe gone").into();
    assert!(matches!(&err, AppError::Io(msg) if msg.contains("pipe gone")));
}
