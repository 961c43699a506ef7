use cli_support::confirm_overwrite;
use std::io::Cursor;

#[test]
fn existing_file_requires_yes() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("run.log");
    std::fs::write(&path, "old").unwrap();

    let mut out = Vec::new();
    let ok = confirm_overwrite(&path, false, &mut Cursor::new(b"y\n".to_vec()), &mut out).unwrap();
    assert!(ok);
    assert!(String::from_utf8(out).unwrap().contains("already exists"));

    let ok = confirm_overwrite(&path, false, &mut Cursor::new(b"n\n".to_vec()), &mut Vec::new())
        .unwrap();
    assert!(!ok);

    let ok = confirm_overwrite(&path, false, &mut Cursor::new(Vec::new()), &mut Vec::new()).unwrap();
    assert!(!ok);

    let ok = confirm_overwrite(&path, true, &mut Cursor::new(Vec::new()), &mut Vec::new()).unwrap();
    assert!(ok);
}

#[test]
fn only_y_or_yes_confirms() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("results.csv");
    std::fs::write(&path, "old").unwrap();

    for answer in ["yes\n", "  Y \n", "YES\r\n"] {
        let ok = confirm_overwrite(&path, false, &mut Cursor::new(answer.as_bytes().to_vec()), &mut Vec::new())
            .unwrap();
        assert!(ok, "{answer:?} should confirm");
    }
    for answer in ["yolo\n", "yess\n", "ye\n", "no\n", "y es\n"] {
        let ok = confirm_overwrite(&path, false, &mut Cursor::new(answer.as_bytes().to_vec()), &mut Vec::new())
            .unwrap();
        assert!(!ok, "{answer:?} should abort");
    }
}

#[test]
fn logging_to_file_creates_parent_dirs() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("logs").join("run.log");
    cli_support::init_logging(Some(&path)).unwrap();
    tracing::info!("hello from the test");
    assert!(path.is_file());
}
