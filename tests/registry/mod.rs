use scripthub::error::HubError;
use scripthub::registry::Registry;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

fn touch(dir: &Path, name: &str) {
    fs::write(dir.join(name), "print('hi')\n").expect("write file");
}

fn names(registry: &Registry) -> Vec<String> {
    registry
        .list_scripts()
        .expect("list scripts")
        .into_iter()
        .map(|script| script.name)
        .collect()
}

#[test]
fn missing_directory_is_configuration_error() {
    let dir = tempdir().expect("tempdir");
    let registry = Registry::new(dir.path().join("nope"));
    assert!(matches!(
        registry.list_scripts(),
        Err(HubError::Configuration(_))
    ));
}

#[test]
fn empty_directory_lists_nothing() {
    let dir = tempdir().expect("tempdir");
    assert!(names(&Registry::new(dir.path())).is_empty());
}

#[test]
fn lists_sorted_and_skips_helpers() {
    let dir = tempdir().expect("tempdir");
    for name in [
        "stock_analysis.py",
        "ai_research.py",
        "backup.sh",
        "__init__.py",
        "test_seo.py",
        "seo_test.py",
        ".hidden.py",
        "notes.txt",
        "README",
    ] {
        touch(dir.path(), name);
    }
    fs::create_dir(dir.path().join("nested.py")).expect("dir named like a script");

    assert_eq!(
        names(&Registry::new(dir.path())),
        vec!["ai_research.py", "backup.sh", "stock_analysis.py"]
    );
}

#[test]
fn extension_match_ignores_case() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "Report.PY");
    assert_eq!(names(&Registry::new(dir.path())), vec!["Report.PY"]);
}

#[test]
fn duplicate_names_keep_first_sorted() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "Tool.py");
    touch(dir.path(), "tool.py");

    // probe whether the filesystem is case-sensitive
    let entries = fs::read_dir(dir.path()).expect("read dir").count();
    let listed = names(&Registry::new(dir.path()));
    assert_eq!(listed.len(), 1);
    if entries == 2 {
        assert_eq!(listed, vec!["Tool.py"]);
    }
}

#[test]
fn custom_extensions_and_interpreters() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "job.rb");
    touch(dir.path(), "job.py");

    let registry = Registry::new(dir.path())
        .extensions(["rb"])
        .interpreters(HashMap::from([("rb".to_string(), "ruby".to_string())]));
    let scripts = registry.list_scripts().expect("list");
    assert_eq!(scripts.len(), 1);
    assert_eq!(scripts[0].name, "job.rb");
    assert_eq!(scripts[0].interpreter.as_deref(), Some("ruby"));
}

#[test]
fn default_interpreters_map_python_and_shell() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "a.py");
    touch(dir.path(), "b.sh");

    let scripts = Registry::new(dir.path()).list_scripts().expect("list");
    assert_eq!(scripts[0].interpreter.as_deref(), Some("python3"));
    assert_eq!(scripts[1].interpreter.as_deref(), Some("sh"));
    assert!(scripts.iter().all(|s| s.path.is_absolute()));
}

#[test]
fn recursive_scan_is_opt_in() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "top.py");
    let sub = dir.path().join("reports");
    fs::create_dir(&sub).expect("mkdir");
    touch(&sub, "weekly.py");
    let cache = dir.path().join("__pycache__");
    fs::create_dir(&cache).expect("mkdir cache");
    touch(&cache, "cached.py");

    assert_eq!(names(&Registry::new(dir.path())), vec!["top.py"]);
    assert_eq!(
        names(&Registry::new(dir.path()).recursive(true)),
        vec!["reports/weekly.py", "top.py"]
    );
}

#[test]
fn parameter_hints_come_from_source() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("seo.py"),
        r#"import argparse
parser = argparse.ArgumentParser()
parser.add_argument("--url", required=True)
parser.add_argument("-d", "--depth", default="quick")
"#,
    )
    .expect("write script");

    let scripts = Registry::new(dir.path()).list_scripts().expect("list");
    assert_eq!(scripts[0].parameter_hints, vec!["url", "depth"]);
}

#[test]
fn find_is_case_insensitive() {
    let dir = tempdir().expect("tempdir");
    touch(dir.path(), "Stock.py");
    let registry = Registry::new(dir.path());

    assert_eq!(registry.find("stock.py").expect("find").name, "Stock.py");
    assert!(matches!(
        registry.find("missing.py"),
        Err(HubError::NotFound(_))
    ));
}

#[test]
fn listing_reflects_disk_changes() {
    let dir = tempdir().expect("tempdir");
    let registry = Registry::new(dir.path());
    touch(dir.path(), "one.py");
    assert_eq!(names(&registry), vec!["one.py"]);

    touch(dir.path(), "two.py");
    fs::remove_file(dir.path().join("one.py")).expect("remove");
    assert_eq!(names(&registry), vec!["two.py"]);
}
