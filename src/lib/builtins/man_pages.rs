use std::io::Write;

/// Writes `man_page` to `out` if any argument asks for help.
pub fn check_help(args: &[String], man_page: &'static str, out: &mut dyn Write) -> bool {
    for arg in args {
        if arg == "-h" || arg == "--help" {
            let _ = writeln!(out, "{}", man_page);
            return true;
        }
    }
    false
}

pub const MAN_ECHO: &str = r#"NAME
    echo - display a line of text

SYNOPSIS
    echo [ -h | --help ] [-n] [STRING]...

DESCRIPTION
    Print the STRING(s) to standard output.

OPTIONS
    -n
        do not output the trailing newline"#;

pub const MAN_TRUE: &str = r#"NAME
    true - does nothing successfully

SYNOPSIS
    true

DESCRIPTION
    Sets the exit status to 0."#;

pub const MAN_FALSE: &str = r#"NAME
    false - does nothing unsuccessfully

SYNOPSIS
    false

DESCRIPTION
    Sets the exit status to 1."#;

pub const MAN_JOBS: &str = r#"NAME
    jobs - list the jobs known to the shell

SYNOPSIS
    jobs [ -h | --help ] [-p | -c | -g] [-l] [ID]...

DESCRIPTION
    Prints the id, process group, state, and command of each job, or of the given jobs.

OPTIONS
    -p, --pid
        print the process id of every process in each job
    -c, --command
        print the program run by every process in each job
    -g, --group
        print only the process group of each job
    -l, --last
        only consider the most recent job"#;

pub const MAN_BG: &str = r#"NAME
    bg - sends jobs to background

SYNOPSIS
    bg [ID]...

DESCRIPTION
    bg sends the job to the background resuming it if it has stopped. Without an ID, the
    most recent stopped job is chosen."#;

pub const MAN_FG: &str = r#"NAME
    fg - bring job to foreground

SYNOPSIS
    fg [ID]

DESCRIPTION
    fg brings the specified job to foreground resuming it if it has stopped. Without an ID,
    the most recent stopped or background job is chosen."#;
