mod job_control;
mod man_pages;

use self::man_pages::*;
use crate::shell::{status::Status, BuiltinFunction, Shell};
use std::io::Write;

macro_rules! map {
    ($($name:expr => $func:ident: $help:expr),+) => {{
        BuiltinMap {
            name: &[$($name),+],
            help: &[$($help),+],
            functions: &[$($func),+],
        }
    }
}}

/// Builtins are in A-Z order.
pub const BUILTINS: &BuiltinMap = &map!(
    "bg" => builtin_bg : "Resumes a stopped job in the background",
    "echo" => builtin_echo : "Display a line of text",
    "false" => builtin_false : "Do nothing, unsuccessfully",
    "fg" => builtin_fg : "Resumes and sets a job as the active process",
    "jobs" => builtin_jobs : "Displays the jobs known to the shell",
    "true" => builtin_true : "Do nothing, successfully"
);

/// A builtin command: its name, a one line description, and the code that runs it. The
/// argument vector passed to `main` includes the command name.
#[derive(Clone, Copy)]
pub struct Builtin {
    pub name: &'static str,
    pub help: &'static str,
    pub main: BuiltinFunction,
}

pub struct BuiltinMap {
    pub(crate) name:      &'static [&'static str],
    pub(crate) help:      &'static [&'static str],
    pub(crate) functions: &'static [BuiltinFunction],
}

impl BuiltinMap {
    pub fn contains_key(&self, func: &str) -> bool { self.name.iter().any(|&name| name == func) }

    pub fn keys(&self) -> &'static [&'static str] { self.name }

    pub fn get(&self, func: &str) -> Option<Builtin> {
        let pos = self.name.binary_search(&func).ok()?;
        Some(Builtin { name: self.name[pos], help: self.help[pos], main: self.functions[pos] })
    }
}

/// Looks up the builtin called `name`.
pub fn builtin(name: &str) -> Option<BuiltinFunction> { BUILTINS.get(name).map(|b| b.main) }

fn builtin_jobs(args: &[String], shell: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    if check_help(args, MAN_JOBS, out) {
        return Status::SUCCESS;
    }
    job_control::jobs(&args[1..], shell, out)
}

fn builtin_bg(args: &[String], shell: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    if check_help(args, MAN_BG, out) {
        return Status::SUCCESS;
    }
    job_control::bg(&args[1..], shell, out)
}

fn builtin_fg(args: &[String], shell: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    if check_help(args, MAN_FG, out) {
        return Status::SUCCESS;
    }
    job_control::fg(&args[1..], shell, out)
}

fn builtin_echo(args: &[String], _: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    if check_help(args, MAN_ECHO, out) {
        return Status::SUCCESS;
    }

    let mut words = args.iter().skip(1).peekable();
    let newline = if words.peek().map(|word| word.as_str()) == Some("-n") {
        words.next();
        false
    } else {
        true
    };

    let mut line = words.map(String::as_str).collect::<Vec<_>>().join(" ");
    if newline {
        line.push('\n');
    }
    match out.write_all(line.as_bytes()) {
        Ok(()) => Status::SUCCESS,
        Err(why) => Status::error(format!("echo: {}", why)),
    }
}

fn builtin_true(args: &[String], _: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    check_help(args, MAN_TRUE, out);
    Status::SUCCESS
}

fn builtin_false(args: &[String], _: &mut Shell<'_>, out: &mut dyn Write) -> Status {
    if check_help(args, MAN_FALSE, out) {
        return Status::SUCCESS;
    }
    Status::FAILURE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_is_sorted() {
        let mut sorted = BUILTINS.keys().to_vec();
        sorted.sort_unstable();
        assert_eq!(sorted, BUILTINS.keys());
        assert!(BUILTINS.contains_key("fg"));
        assert!(builtin("jobs").is_some());
        assert!(builtin("cd").is_none());
    }

    #[test]
    fn echo_writes_to_its_output() {
        let mut shell = Shell::builder().notifications(std::io::sink()).build();
        let mut out = Vec::new();
        let args = vec!["echo".to_owned(), "-n".to_owned(), "a".to_owned(), "b".to_owned()];
        assert!(builtin_echo(&args, &mut shell, &mut out).is_success());
        assert_eq!(out, b"a b");

        let mut out = Vec::new();
        assert!(builtin_echo(&args[..1], &mut shell, &mut out).is_success());
        assert_eq!(out, b"\n");
    }
}
