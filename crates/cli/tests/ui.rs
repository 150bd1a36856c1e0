use std::io::Write;

use assert_cmd::Command;

fn knotd() -> Command {
    Command::cargo_bin("knotd").expect("binary builds")
}

#[test]
fn execute_write_then_read() {
    knotd()
        .arg("-e")
        .arg(r#"write (type="Person" name="Alice" value="1")"#)
        .arg("-e")
        .arg(r#"read (type="Person" name="Alice" result=((value)))"#)
        .assert()
        .success()
        .stdout(predicates::str::contains(r#"ok (("1"))"#));
}

#[test]
fn requests_from_stdin() {
    knotd()
        .write_stdin(concat!(
            "# seed\n",
            "write (name=\"a\" value=\"1\")\n",
            "\n",
            "read (name=\"a\" result=((value)))\n",
        ))
        .assert()
        .success()
        .stdout(predicates::str::contains(r#"ok (("1"))"#));
}

#[test]
fn requests_from_a_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "write (name=\"x\" value=\"9\")").unwrap();
    writeln!(file, "read (name=\"x\" result=((value)))").unwrap();

    knotd()
        .arg("-f")
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicates::str::contains(r#"ok (("9"))"#));
}

#[test]
fn errors_set_the_exit_code() {
    knotd()
        .arg("-e")
        .arg(r#"read (name="nobody")"#)
        .assert()
        .failure()
        .stdout(predicates::str::contains("error \"EMPTY"));
}

#[test]
fn config_file_sets_the_instance() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[server]").unwrap();
    writeln!(config, "instance = ab").unwrap();

    knotd()
        .arg("--config")
        .arg(config.path())
        .arg("-e")
        .arg(r#"write (name="n")"#)
        .arg("-e")
        .arg(r#"read (name="n" result=((guid)))"#)
        .assert()
        .success()
        .stdout(predicates::str::contains("000000ab"));
}

#[test]
fn bad_config_fails_fast() {
    let mut config = tempfile::NamedTempFile::new().unwrap();
    writeln!(config, "[smp]").unwrap();
    writeln!(config, "role = bystander").unwrap();

    knotd()
        .arg("--config")
        .arg(config.path())
        .assert()
        .failure();
}
