//! Splits a command line into pipelines. There is no quoting or expansion: words are separated
//! by whitespace, pipelines by `;`, and stages by `|`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("expected a path after '{0}'")]
    MissingPath(String),
    #[error("empty command in pipeline '{0}'")]
    EmptyStage(String),
    #[error("'&' may only end a pipeline")]
    StrayAmpersand,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Redirect {
    Input { fd: i32, path: String },
    Output { fd: i32, path: String, append: bool },
    Duplicate { fd: i32, source: i32 },
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Stage {
    pub argv:      Vec<String>,
    pub redirects: Vec<Redirect>,
}

/// One pipeline as it will appear in the job list.
#[derive(Debug, PartialEq, Eq)]
pub struct Statement {
    pub text:       String,
    pub stages:     Vec<Stage>,
    pub background: bool,
    pub negate:     bool,
}

/// What a word means when it is a redirection operator, possibly with its target attached.
enum Operator<'a> {
    Input(i32, &'a str),
    Output(i32, bool, &'a str),
    Duplicate(i32, i32),
}

fn operator(word: &str) -> Option<Operator<'_>> {
    let digits = word.bytes().take_while(u8::is_ascii_digit).count();
    let (fd, rest) = word.split_at(digits);
    let fd = if fd.is_empty() { None } else { fd.parse::<i32>().ok() };

    if let Some(target) = rest.strip_prefix(">&") {
        target.parse::<i32>().ok().map(|source| Operator::Duplicate(fd.unwrap_or(1), source))
    } else if let Some(target) = rest.strip_prefix(">>") {
        Some(Operator::Output(fd.unwrap_or(1), true, target))
    } else if let Some(target) = rest.strip_prefix('>') {
        Some(Operator::Output(fd.unwrap_or(1), false, target))
    } else if let Some(target) = rest.strip_prefix('<') {
        Some(Operator::Input(fd.unwrap_or(0), target))
    } else {
        None
    }
}

fn parse_stage(text: &str, pipeline: &str) -> Result<Stage, ParseError> {
    let mut stage = Stage::default();
    let mut words = text.split_whitespace();

    while let Some(word) = words.next() {
        let mut target = |attached: &str| -> Result<String, ParseError> {
            if !attached.is_empty() {
                Ok(attached.to_owned())
            } else {
                words.next().map(str::to_owned).ok_or_else(|| ParseError::MissingPath(word.to_owned()))
            }
        };

        let redirect = match operator(word) {
            Some(Operator::Duplicate(fd, source)) => Redirect::Duplicate { fd, source },
            Some(Operator::Output(fd, append, attached)) => {
                Redirect::Output { fd, path: target(attached)?, append }
            }
            Some(Operator::Input(fd, attached)) => Redirect::Input { fd, path: target(attached)? },
            None => {
                stage.argv.push(word.to_owned());
                continue;
            }
        };
        stage.redirects.push(redirect);
    }

    if stage.argv.is_empty() {
        return Err(ParseError::EmptyStage(pipeline.to_owned()));
    }
    Ok(stage)
}

fn parse_statement(text: &str) -> Result<Statement, ParseError> {
    let mut text = text.trim();
    let background = text.ends_with('&') && !text.ends_with(">&");
    if background {
        text = text[..text.len() - 1].trim_end();
    }
    if text.contains('&') && text.split_whitespace().any(|word| word.ends_with('&')) {
        return Err(ParseError::StrayAmpersand);
    }

    let negate = text.starts_with("! ");
    let pipeline = if negate { text[2..].trim_start() } else { text };
    let stages =
        pipeline.split('|').map(|stage| parse_stage(stage, pipeline)).collect::<Result<_, _>>()?;

    Ok(Statement { text: pipeline.to_owned(), stages, background, negate })
}

/// Parses every pipeline of `line`. Empty pipelines, as from `;;`, are skipped.
pub fn parse_line(line: &str) -> Result<Vec<Statement>, ParseError> {
    line.split(';').filter(|text| !text.trim().is_empty()).map(parse_statement).collect()
}
