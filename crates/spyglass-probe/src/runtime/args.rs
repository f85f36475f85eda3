//! Command-line construction for task executors.
//!
//! Built-in executors hard-code their argument shape; configured
//! `command` executors get `{target}`, `{count}`, `{timeout}` and
//! `{ipv6}` placeholder substitution inside each default argument.

use std::path::{Path, PathBuf};

use spyglass_core::protocol::TaskParams;

use crate::config::{ExecutorKind, LineFormatter};

/// Build the argument vector for an executor family.
#[must_use]
pub fn build_args(kind: ExecutorKind, default_args: &[String], params: &TaskParams) -> Vec<String> {
    match kind {
        ExecutorKind::Ping => build_ping_args(params),
        ExecutorKind::Mtr => build_mtr_args(params),
        ExecutorKind::Nexttrace => build_nexttrace_args(params),
        ExecutorKind::Command => substitute_args(default_args, params),
    }
}

fn build_ping_args(params: &TaskParams) -> Vec<String> {
    let mut args = Vec::new();

    if params.count > 0 {
        args.push("-c".to_string());
        args.push(params.count.to_string());
    }
    if params.timeout > 0 {
        args.push("-W".to_string());
        args.push(params.timeout.to_string());
    }
    args.push(if params.ipv6 { "-6" } else { "-4" }.to_string());
    args.push(params.target.clone());
    args
}

fn build_mtr_args(params: &TaskParams) -> Vec<String> {
    let mut args = vec!["--report".to_string(), "--report-cycles".to_string()];

    if params.count > 0 {
        args.push(params.count.to_string());
    } else {
        args.push("10".to_string());
    }
    args.push("--no-dns".to_string());
    args.push(if params.ipv6 { "-6" } else { "-4" }.to_string());
    args.push("--report-wide".to_string());
    args.push(params.target.clone());
    args
}

fn build_nexttrace_args(params: &TaskParams) -> Vec<String> {
    let mut args = vec![if params.ipv6 { "-6" } else { "-4" }.to_string()];

    if params.count > 0 {
        args.push("-m".to_string());
        args.push(params.count.to_string());
    }
    if params.timeout > 0 {
        args.push("-t".to_string());
        args.push(params.timeout.to_string());
    }

    // Extra options, sorted for a stable command line. An empty value
    // means a bare flag.
    let mut extras: Vec<(&String, &String)> = params.extra.iter().collect();
    extras.sort_by_key(|(key, _)| (*key).clone());
    for (key, value) in extras {
        args.push(key.clone());
        if !value.is_empty() {
            args.push(value.clone());
        }
    }

    args.push(params.target.clone());
    args
}

/// Apply placeholder substitution to configured default arguments.
/// Placeholders in unspecified parameter positions substitute empty
/// strings or zeros.
#[must_use]
pub fn substitute_args(default_args: &[String], params: &TaskParams) -> Vec<String> {
    default_args
        .iter()
        .map(|arg| {
            arg.replace("{target}", &params.target)
                .replace("{count}", &params.count.to_string())
                .replace("{timeout}", &params.timeout.to_string())
                .replace("{ipv6}", if params.ipv6 { "true" } else { "false" })
        })
        .collect()
}

/// Apply the configured line formatter to one output line.
#[must_use]
pub fn format_line(line: String, formatter: LineFormatter) -> String {
    match formatter {
        LineFormatter::None => line,
        LineFormatter::Newline => format!("{line}\n"),
    }
}

/// Locate an executable: a path containing a separator must exist as a
/// file; a bare name is searched on `PATH`.
#[must_use]
pub fn find_executable(path: &str) -> Option<PathBuf> {
    if path.is_empty() {
        return None;
    }

    if path.contains('/') {
        let candidate = Path::new(path);
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let search_path = std::env::var_os("PATH")?;
    std::env::split_paths(&search_path)
        .map(|dir| dir.join(path))
        .find(|candidate| candidate.is_file())
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn params(target: &str, count: u32, timeout: u32, ipv6: bool) -> TaskParams {
        TaskParams {
            target: target.to_string(),
            count,
            timeout,
            ipv6,
            extra: HashMap::new(),
        }
    }

    #[test]
    fn ping_args_shape() {
        let args = build_args(ExecutorKind::Ping, &[], &params("8.8.8.8", 2, 5, false));
        assert_eq!(args, vec!["-c", "2", "-W", "5", "-4", "8.8.8.8"]);

        let args = build_args(ExecutorKind::Ping, &[], &params("2001:db8::1", 0, 0, true));
        assert_eq!(args, vec!["-6", "2001:db8::1"]);
    }

    #[test]
    fn mtr_args_default_cycles() {
        let args = build_args(ExecutorKind::Mtr, &[], &params("example.com", 0, 0, false));
        assert_eq!(
            args,
            vec!["--report", "--report-cycles", "10", "--no-dns", "-4", "--report-wide", "example.com"]
        );
    }

    #[test]
    fn nexttrace_args_include_sorted_extras() {
        let mut p = params("example.com", 30, 2, false);
        p.extra.insert("-T".to_string(), String::new());
        p.extra.insert("-p".to_string(), "443".to_string());

        let args = build_args(ExecutorKind::Nexttrace, &[], &p);
        assert_eq!(
            args,
            vec!["-4", "-m", "30", "-t", "2", "-T", "-p", "443", "example.com"]
        );
    }

    #[test]
    fn placeholder_substitution() {
        let defaults = vec![
            "-s".to_string(),
            "{target}".to_string(),
            "--count={count}".to_string(),
            "--v6={ipv6}".to_string(),
        ];
        let args = substitute_args(&defaults, &params("example.com", 4, 0, false));
        assert_eq!(args, vec!["-s", "example.com", "--count=4", "--v6=false"]);
    }

    #[test]
    fn unspecified_placeholders_become_zeros() {
        let defaults = vec!["{count}/{timeout}/{target}".to_string()];
        let args = substitute_args(&defaults, &TaskParams::default());
        assert_eq!(args, vec!["0/0/"]);
    }

    #[test]
    fn newline_formatter_appends() {
        assert_eq!(format_line("hop 1".to_string(), LineFormatter::None), "hop 1");
        assert_eq!(
            format_line("hop 1".to_string(), LineFormatter::Newline),
            "hop 1\n"
        );
    }

    #[test]
    fn find_executable_resolves_absolute_and_bare() {
        assert!(find_executable("/bin/sh").is_some());
        assert!(find_executable("sh").is_some());
        assert!(find_executable("/no/such/binary").is_none());
        assert!(find_executable("definitely-not-a-real-tool-42").is_none());
        assert!(find_executable("").is_none());
    }
}
