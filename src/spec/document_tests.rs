use super::{replace_block, set_digest_line};

const TEXT: &str = "\
# curated spec
image_spec_header:
  image_name: 'Roman Research'   # quoted on purpose
  kernel_name: roman-cal

# outputs follow
out:
  test_imports:
  - numpy

# system settings
system:
  spec_version: 1.0
  archive_format: .tar.gz
";

#[test]
fn replace_block_keeps_comments_around_the_block() {
    let updated = replace_block(TEXT, "out", Some("out:\n  test_imports:\n  - scipy\n"));
    assert!(updated.contains("# outputs follow\nout:\n  test_imports:\n  - scipy\n\n# system settings"));
    assert!(updated.contains("image_name: 'Roman Research'   # quoted on purpose"));
    assert!(!updated.contains("numpy"));
}

#[test]
fn replace_block_removes_and_appends() {
    let removed = replace_block(TEXT, "out", None);
    assert!(!removed.contains("out:"));
    assert!(removed.contains("# system settings\nsystem:"));

    let appended = replace_block(&removed, "out", Some("out:\n  data: {}\n"));
    assert!(appended.ends_with("archive_format: .tar.gz\n\nout:\n  data: {}\n"));
}

#[test]
fn digest_line_is_inserted_replaced_and_dropped() {
    let inserted = set_digest_line(TEXT, Some("abc")).expect("insert digest");
    assert!(inserted.contains("  archive_format: .tar.gz\n  spec_sha256: \"abc\"\n"));

    let replaced = set_digest_line(&inserted, Some("def")).expect("replace digest");
    assert!(replaced.contains("spec_sha256: \"def\""));
    assert!(!replaced.contains("\"abc\""));

    let dropped = set_digest_line(&replaced, None).expect("drop digest");
    assert_eq!(dropped, TEXT);
}

#[test]
fn digest_line_requires_block_style_system() {
    let flow = "system: {spec_version: 1}\n";
    assert!(set_digest_line(flow, Some("abc")).is_err());
    assert!(set_digest_line("image_spec_header: {}\n", Some("abc")).is_err());
}
