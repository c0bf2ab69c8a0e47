use super::*;

/// Strips NUL bytes, carriage returns and ANSI escape sequences from shell output.
pub static CONTROL_SEQUENCES: Lazy<Regex> = Lazy::new(|| {
    match Regex::new(r"\x00|\r|\x1b\[[0-9;?]*[A-Za-z]") {
        Ok(re) => re,
        Err(err) => panic!("invalid CONTROL_SEQUENCES regex: {err}"),
    }
});

pub(crate) fn compile(pattern: &str) -> Result<Regex, CliError> {
    Regex::new(pattern).map_err(|source| CliError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Returns the last non-blank line of `output`, trimmed at the end.
///
/// Prompts never carry a trailing newline, so this is the prompt candidate.
pub fn last_line(output: &str) -> &str {
    output
        .lines()
        .rev()
        .map(str::trim_end)
        .find(|line| !line.is_empty())
        .unwrap_or("")
}

/// Prompts that may appear while a command runs, with the text to answer them.
///
/// Used for confirmations such as `[y/n]?` or a `Password:` request while
/// entering a privileged mode.
#[derive(Debug, Clone, Default)]
pub struct ActionMap {
    actions: Vec<(Regex, String)>,
}

impl ActionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an answer for `pattern`. The reply is sent verbatim, include a newline if needed.
    pub fn on(mut self, pattern: &str, reply: impl Into<String>) -> Result<Self, CliError> {
        self.actions.push((compile(pattern)?, reply.into()));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// First reply whose pattern matches `text`, in insertion order.
    pub fn reply_for(&self, text: &str) -> Option<&str> {
        self.actions
            .iter()
            .find(|(re, _)| re.is_match(text))
            .map(|(_, reply)| reply.as_str())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().map(|(re, _)| re.as_str())
    }
}

/// Output patterns that turn a command into a [`CliError::CommandError`].
#[derive(Debug, Clone, Default)]
pub struct ErrorMap {
    errors: Vec<(Regex, String)>,
}

impl ErrorMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, pattern: &str, message: impl Into<String>) -> Result<Self, CliError> {
        self.errors.push((compile(pattern)?, message.into()));
        Ok(self)
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Returns `(pattern, message)` of the first entry matching `output`.
    pub fn check(&self, output: &str) -> Option<(&str, &str)> {
        self.errors
            .iter()
            .find(|(re, _)| re.is_match(output))
            .map(|(re, message)| (re.as_str(), message.as_str()))
    }
}

/// What a transport should do after feeding a chunk into an [`ExpectState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpectStep {
    /// Keep reading.
    Pending,
    /// An action pattern matched: send this text, then keep reading.
    Reply(String),
    /// The expected pattern matched; carries the full output.
    Done(String),
}

/// Incremental matcher shared by transports implementing [`Session::send_and_expect`].
///
/// Actions are checked against the text received since the last action fired,
/// then the expected pattern, and once it matches the whole output is checked
/// against the error map.
pub struct ExpectState<'a> {
    expected: Regex,
    actions: Option<&'a ActionMap>,
    errors: Option<&'a ErrorMap>,
    window: String,
    output: String,
}

impl<'a> ExpectState<'a> {
    pub fn new(
        expected: &str,
        actions: Option<&'a ActionMap>,
        errors: Option<&'a ErrorMap>,
    ) -> Result<Self, CliError> {
        Ok(Self {
            expected: compile(expected)?,
            actions,
            errors,
            window: String::new(),
            output: String::new(),
        })
    }

    pub fn feed(&mut self, chunk: &str) -> Result<ExpectStep, CliError> {
        let clean = CONTROL_SEQUENCES.replace_all(chunk, "");
        self.window.push_str(&clean);
        self.output.push_str(&clean);

        if let Some(reply) = self.actions.and_then(|a| a.reply_for(&self.window)) {
            trace!("Action matched, replying {:?}", reply);
            let reply = reply.to_string();
            self.window.clear();
            return Ok(ExpectStep::Reply(reply));
        }

        if !self.expected.is_match(&self.window) {
            return Ok(ExpectStep::Pending);
        }

        if let Some((pattern, message)) = self.errors.and_then(|e| e.check(&self.output)) {
            return Err(CliError::CommandError {
                pattern: pattern.to_string(),
                message: message.to_string(),
                output: self.output.clone(),
            });
        }
        Ok(ExpectStep::Done(self.output.clone()))
    }

    /// Everything received so far, used for timeout reports.
    pub fn output(&self) -> &str {
        &self.output
    }
}
