use std::io::Write;
use std::process::Command;

use tempfile::NamedTempFile;

const TRACE: &str = "\
#domprof guest stack trace
#tracing domain 7 on 2026-10-16 14:02:11 UTC (+0000)

0xffffffff81001000
0xffffffff81001840
0x10
1

0xffffffff81002000
0
";

fn file_with(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

fn symbol_table() -> NamedTempFile {
    file_with(
        "ffffffff81001000 T do_idle\n\
         ffffffff81001800 t _ZN6kernel4idle17h0123456789abcdefE\n\
         ffffffff81002000 T schedule\n",
    )
}

fn symbolize(args: &[&std::ffi::OsStr]) -> std::process::Output {
    Command::new(env!("CARGO_BIN_EXE_domprof-symbolize"))
        .args(args)
        .output()
        .expect("Failed to run domprof-symbolize")
}

#[test]
fn test_resolves_raw_addresses() {
    let syms = symbol_table();
    let trace = file_with(TRACE);

    let output = symbolize(&[syms.path().as_os_str(), trace.path().as_os_str()]);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert_eq!(
        stdout,
        "#domprof guest stack trace\n\
         #tracing domain 7 on 2026-10-16 14:02:11 UTC (+0000)\n\
         \n\
         do_idle\n\
         _ZN6kernel4idle17h0123456789abcdefE+0x40\n\
         0x10\n\
         1\n\
         \n\
         schedule\n\
         0\n"
    );
}

#[test]
fn test_demangle_flag() {
    let syms = symbol_table();
    let trace = file_with(TRACE);

    let output = symbolize(&[
        "--demangle".as_ref(),
        syms.path().as_os_str(),
        trace.path().as_os_str(),
    ]);

    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8(output.stdout).unwrap();
    assert!(stdout.contains("\nkernel::idle+0x40\n"), "{stdout}");
}

#[test]
fn test_missing_arguments_is_usage_error() {
    let syms = symbol_table();
    let output = symbolize(&[syms.path().as_os_str()]);
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_unreadable_trace() {
    let syms = symbol_table();
    let output = symbolize(&[syms.path().as_os_str(), "/nonexistent/trace.txt".as_ref()]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Cannot open trace file"));
}

#[test]
fn test_unreadable_symbol_table() {
    let trace = file_with(TRACE);
    let output = symbolize(&["/nonexistent/System.map".as_ref(), trace.path().as_os_str()]);
    assert_eq!(output.status.code(), Some(2));
}
