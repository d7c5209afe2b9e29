// Remapd Configuration Parsing Tests
// Public-API coverage: sequence syntax, filters, commands, rejection

use remapd_core::config::{parse_config, ConfigError, Filter, MappingOutput};
use remapd_core::{format_sequence, Key};

#[test]
fn parses_a_realistic_configuration() {
    let config = parse_config(
        r#"
        exit_sequence = "Shift-Escape X"

        [logical_keys]
        hyper = ["CAPSLOCK", "F24"]

        [macros]
        Save = "Control-S"

        [[context]]
        class = "^firefox$"
        fallthrough = true
        mappings = [
            ["hyper-J", "DOWN"],
            ["hyper-K", "UP"],
        ]

        [[context]]
        device = "trackball"
        mappings = [["BUTTON_SIDE", "Save"]]

        [[context]]
        mappings = [
            ["CAPSLOCK", "ESCAPE"],
            ["F2", "Save"],
            ["F3", "@nav"],
            ["F4", "$(notify-send hello)"],
            ["F5", "screenshot"],
        ]
        commands = [["screenshot", "Meta-P"]]
        "#,
    )
    .unwrap();

    assert_eq!(config.contexts.len(), 3);
    assert_eq!(config.logical_keys.len(), 5); // four builtins + hyper
    assert_eq!(config.virtual_key_names, vec!["nav".to_string()]);
    assert_eq!(config.command_names, vec!["screenshot".to_string()]);
    assert_eq!(config.terminal_commands, vec!["notify-send hello".to_string()]);
    assert!(config.has_mouse_mappings());
    assert!(config.contexts[0].filter.has_focus_filter());
    assert!(!config.contexts[2].filter.has_focus_filter());
}

#[test]
fn macro_expansion_applies_to_outputs() {
    let config = parse_config(
        r#"
        [macros]
        Save = "Control-S"

        [[context]]
        mappings = [["F2", "Save"]]
        "#,
    )
    .unwrap();
    match &config.contexts[0].mappings[0].output {
        MappingOutput::Sequence(seq) => {
            // Control is a logical key; the chord holds it around S.
            assert_eq!(seq.len(), 2);
            assert!(seq[0].key.is_logical());
            assert_eq!(seq[1].key, Key::S);
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[test]
fn input_sequences_carry_async_releases() {
    let config = parse_config(
        r#"
        [[context]]
        mappings = [["Control-K C", "X"]]
        "#,
    )
    .unwrap();
    let input = &config.contexts[0].mappings[0].input;
    let rendered = format_sequence(input);
    // Chord key and step keys release asynchronously; the held modifier
    // releases last.
    assert!(rendered.starts_with("+Logical1 +K ~K +C ~C"));
    assert!(rendered.ends_with("~Logical1"));
}

#[test]
fn filter_matching_semantics() {
    let exact = Filter::new("^kitty$");
    assert!(exact.matches("Kitty"));
    assert!(!exact.matches("kitty-tabs"));

    let any_of = Filter::new("firefox|librewolf");
    assert!(any_of.matches("LibreWolf"));

    let substring = Filter::new("term");
    assert!(substring.matches("xterm-256color"));
}

#[test]
fn rejects_unknown_keys_with_context() {
    let err = parse_config(
        r#"
        [[context]]
        mappings = [["NOT_A_KEY", "B"]]
        "#,
    )
    .unwrap_err();
    match err {
        ConfigError::Sequence { mapping, .. } => assert_eq!(mapping, "NOT_A_KEY"),
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn rejects_bad_logical_sides() {
    let err = parse_config(
        r#"
        [logical_keys]
        thumb = ["SPACE", "NOT_A_KEY"]
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::LogicalSide { .. }));
}

#[test]
fn rejects_unknown_toml_keys() {
    let err = parse_config(
        r#"
        [[context]]
        clazz = "typo"
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn command_without_output_is_rejected() {
    let err = parse_config(
        r#"
        [[context]]
        mappings = [["F1", "launch_editor"]]
        "#,
    )
    .unwrap_err();
    assert!(matches!(err, ConfigError::UndefinedCommand(name) if name == "launch_editor"));
}

#[test]
fn timeouts_parse_in_inputs_and_outputs() {
    let config = parse_config(
        r#"
        [[context]]
        mappings = [["A 250ms", "B 50ms C"]]
        "#,
    )
    .unwrap();
    let mapping = &config.contexts[0].mappings[0];
    assert!(mapping.input.iter().any(|e| e.key == Key::TIMEOUT && e.timeout == 250));
    match &mapping.output {
        MappingOutput::Sequence(seq) => {
            assert!(seq.iter().any(|e| e.key == Key::TIMEOUT && e.timeout == 50))
        }
        other => panic!("unexpected output {:?}", other),
    }
}

#[test]
fn device_only_context_has_no_focus_filter() {
    let config = parse_config(
        r#"
        [[context]]
        device = "^Internal Keyboard$"
        mappings = [["CAPSLOCK", "ESCAPE"]]
        "#,
    )
    .unwrap();
    let filter = &config.contexts[0].filter;
    assert!(!filter.has_focus_filter());
    assert!(filter.device.is_some());
}
