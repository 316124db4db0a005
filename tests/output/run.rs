use crate::support::run_record;
use scripthub::export::export;
use scripthub::model::RunStatus;
use scripthub::output::{configure, format_duration_ms, print_run};
use time::OffsetDateTime;

#[test]
fn print_run_shows_label_and_output() {
    configure(true);
    let mut run = run_record("r-9", "seo.py", RunStatus::Failed, OffsetDateTime::now_utc());
    run.stderr = "bad url\n".to_string();

    let mut out = Vec::new();
    print_run(&mut out, &export(&run)).expect("print run");
    let text = String::from_utf8(out).expect("utf8");

    assert!(text.contains("status: Failed (exit code 1)"));
    assert!(text.contains("output:\nok\n\nErrors/Warnings:\nbad url"));
}

#[test]
fn durations_format_compactly() {
    assert_eq!(format_duration_ms(250), "250ms");
    assert_eq!(format_duration_ms(2000), "2s");
    assert_eq!(format_duration_ms(2500), "2.500s");
}
