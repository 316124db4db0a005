use scripthub::model::ScriptDescriptor;
use scripthub::output::{configure, print_scripts};
use std::path::PathBuf;

#[test]
fn print_scripts_empty() {
    configure(true);
    let mut out = Vec::new();
    print_scripts(&mut out, &[]).expect("print scripts");
    assert!(String::from_utf8(out).expect("utf8").contains("No scripts found."));
}

#[test]
fn print_scripts_lists_hints() {
    configure(true);
    let scripts = vec![
        ScriptDescriptor {
            name: "ai_research.py".to_string(),
            path: PathBuf::from("/srv/scripts/ai_research.py"),
            interpreter: Some("python3".to_string()),
            parameter_hints: vec!["topic".to_string(), "depth".to_string()],
        },
        ScriptDescriptor {
            name: "backup.sh".to_string(),
            path: PathBuf::from("/srv/scripts/backup.sh"),
            interpreter: None,
            parameter_hints: Vec::new(),
        },
    ];

    let mut out = Vec::new();
    print_scripts(&mut out, &scripts).expect("print scripts");
    let text = String::from_utf8(out).expect("utf8");

    assert!(text.contains("ai_research.py\n  path: /srv/scripts/ai_research.py"));
    assert!(text.contains("interpreter: python3"));
    assert!(text.contains("parameters: topic, depth"));
    assert_eq!(text.matches("interpreter:").count(), 1);
}
