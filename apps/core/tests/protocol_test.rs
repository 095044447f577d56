use switchscan_core::model::{WindowFacts, WindowHandle};
use switchscan_core::protocol::{
    decode_line, decode_request, encode_line, ProtocolError, WorkerLine, WorkerRequest,
    WorkerResultMessage,
};

#[test]
fn request_encodes_as_one_camel_case_line() {
    let request = WorkerRequest::scan(vec!["Chrome".into(), "WindowsTerminal".into()])
        .excluding(vec!["explorer".into()]);

    let line = encode_line(&request).unwrap();

    assert_eq!(
        line,
        "{\"command\":\"scan\",\"plugins\":[\"Chrome\",\"WindowsTerminal\"],\"excludedProcesses\":[\"explorer\"],\"disabledPlugins\":[]}\n"
    );
    assert_eq!(decode_request(&line).unwrap(), request);
}

#[test]
fn decodes_result_line() {
    let raw = br#"{"pluginName":"Chrome","windows":[{"hwnd":123456,"title":"Inbox - Gmail","processName":"chrome","executablePath":"C:\\Apps\\chrome.exe"}]}"#;

    let WorkerLine::Result(message) = decode_line(raw).unwrap() else {
        panic!("expected a result line");
    };

    assert_eq!(message.plugin_name, "Chrome");
    assert_eq!(message.windows.len(), 1);
    assert_eq!(message.windows[0].hwnd, WindowHandle(123456));
    assert_eq!(message.windows[0].title, "Inbox - Gmail");
    assert_eq!(
        message.windows[0].executable_path.as_deref(),
        Some("C:\\Apps\\chrome.exe")
    );
    assert!(!message.is_final);
}

#[test]
fn sentinel_and_blank_lines_are_classified() {
    assert_eq!(decode_line(b"{\"isFinal\":true}\n").unwrap(), WorkerLine::Final);
    assert_eq!(decode_line(b"\r\n").unwrap(), WorkerLine::Blank);
    assert_eq!(
        encode_line(&WorkerResultMessage::sentinel()).unwrap(),
        "{\"isFinal\":true}\n"
    );
}

#[test]
fn error_messages_carry_no_windows() {
    let line = encode_line(&WorkerResultMessage::failed("Teams", "tree walk failed")).unwrap();
    assert_eq!(
        line,
        "{\"pluginName\":\"Teams\",\"windows\":[],\"error\":\"tree walk failed\"}\n"
    );

    let WorkerLine::Result(message) = decode_line(line.as_bytes()).unwrap() else {
        panic!("expected a result line");
    };
    assert_eq!(message.error.as_deref(), Some("tree walk failed"));
    assert!(message.windows.is_empty());
}

#[test]
fn empty_results_still_carry_a_windows_list() {
    let line = encode_line(&WorkerResultMessage::windows("Chrome", Vec::new())).unwrap();
    assert_eq!(line, "{\"pluginName\":\"Chrome\",\"windows\":[]}\n");
}

#[test]
fn malformed_lines_are_rejected() {
    assert!(matches!(
        decode_line(b"{\"pluginName\":\"Chro"),
        Err(ProtocolError::InvalidJson(_))
    ));
    assert_eq!(decode_line(&[0xff, 0xfe, b'\n']), Err(ProtocolError::InvalidUtf8));
    assert_eq!(
        decode_line(b"{\"windows\":[]}"),
        Err(ProtocolError::MissingPluginName)
    );
}

#[test]
fn requests_with_other_commands_are_rejected() {
    assert_eq!(
        decode_request("{\"command\":\"shutdown\"}"),
        Err(ProtocolError::UnsupportedCommand("shutdown".into()))
    );
}

#[test]
fn window_facts_omit_missing_executable_path() {
    let encoded = serde_json::to_string(&WindowFacts::new(5, "Notes", "notepad")).unwrap();
    assert_eq!(encoded, "{\"hwnd\":5,\"title\":\"Notes\",\"processName\":\"notepad\"}");
}
