//! Line framing of interpreter responses.
//!
//! Every wrapped snippet ends its output with an `EXITCODE:<n>` marker followed by
//! `FINISHED`. Errors are bracketed by `ERROR:START` / `ERROR:END`. All markers share
//! a prefix; any line starting with it is control, everything else is data.

pub const DEFAULT_MARKER_PREFIX: &str = "!!!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    prefix: String,
}

impl Default for Markers {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER_PREFIX)
    }
}

impl Markers {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn error_start(&self) -> String {
        format!("{}ERROR:START", self.prefix)
    }

    pub fn error_end(&self) -> String {
        format!("{}ERROR:END", self.prefix)
    }

    pub fn exit_code(&self) -> String {
        format!("{}EXITCODE:", self.prefix)
    }

    pub fn finished(&self) -> String {
        format!("{}FINISHED", self.prefix)
    }

    /// Terminator line the stdin drivers wait for before evaluating a block.
    pub fn exec(&self) -> String {
        format!("{}EXEC", self.prefix)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameLine {
    Data(String),
    ErrorStart,
    ErrorEnd,
    ExitCode(i32),
    Finished,
    UnknownControl(String),
}

/// Remove leading interpreter prompts such as `>> ` (possibly repeated).
pub fn strip_prompts(line: &str) -> &str {
    let mut rest = line;
    while let Some(stripped) = rest.strip_prefix(">>") {
        rest = stripped.trim_start();
    }
    rest
}

pub fn classify(markers: &Markers, raw_line: &str) -> FrameLine {
    let line = strip_prompts(raw_line.trim_end_matches(['\r', '\n']));
    let Some(control) = line.strip_prefix(markers.prefix()) else {
        return FrameLine::Data(line.to_string());
    };
    let control = control.trim_end();
    match control {
        "ERROR:START" => FrameLine::ErrorStart,
        "ERROR:END" => FrameLine::ErrorEnd,
        "FINISHED" => FrameLine::Finished,
        other => match other.strip_prefix("EXITCODE:") {
            Some(code) => code
                .trim()
                .parse()
                .map(FrameLine::ExitCode)
                .unwrap_or_else(|_| FrameLine::UnknownControl(other.to_string())),
            None => FrameLine::UnknownControl(other.to_string()),
        },
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    pub exit_code: i32,
    pub output: Vec<String>,
    pub error: Vec<String>,
}

impl Response {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Accumulates lines of one response until the `FINISHED` marker.
#[derive(Debug)]
pub struct ResponseParser {
    markers: Markers,
    in_error: bool,
    exit_code: Option<i32>,
    output: Vec<String>,
    error: Vec<String>,
}

impl ResponseParser {
    pub fn new(markers: Markers) -> Self {
        Self {
            markers,
            in_error: false,
            exit_code: None,
            output: Vec::new(),
            error: Vec::new(),
        }
    }

    /// Feed one stdout line; returns `true` once the response is complete.
    pub fn feed(&mut self, raw_line: &str) -> bool {
        match classify(&self.markers, raw_line) {
            FrameLine::Data(line) if self.in_error => self.error.push(line),
            FrameLine::Data(line) => {
                if !line.is_empty() {
                    self.output.push(line);
                }
            }
            FrameLine::ErrorStart => self.in_error = true,
            FrameLine::ErrorEnd => self.in_error = false,
            FrameLine::ExitCode(code) => self.exit_code = Some(code),
            FrameLine::Finished => return true,
            FrameLine::UnknownControl(line) => self.output.push(line),
        }
        false
    }

    pub fn finish(self) -> Response {
        // A response without an explicit exit code can only come from a broken template.
        let exit_code = self
            .exit_code
            .unwrap_or(if self.error.is_empty() { 0 } else { 1 });
        Response {
            exit_code,
            output: self.output,
            error: self.error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompts_are_stripped_before_classification() {
        let markers = Markers::default();
        assert_eq!(classify(&markers, ">> >> !!!FINISHED"), FrameLine::Finished);
        assert_eq!(
            classify(&markers, ">> ans = 0"),
            FrameLine::Data("ans = 0".to_string())
        );
    }

    #[test]
    fn parser_separates_output_from_error_block() {
        let mut parser = ResponseParser::new(Markers::default());
        let lines = [
            "converting",
            "!!!ERROR:START",
            "Traceback (most recent call last):",
            "ValueError: bad row",
            "!!!ERROR:END",
            "!!!EXITCODE:1",
        ];
        for line in lines {
            assert!(!parser.feed(line));
        }
        assert!(parser.feed("!!!FINISHED"));
        let response = parser.finish();
        assert_eq!(response.exit_code, 1);
        assert_eq!(response.output, vec!["converting"]);
        assert_eq!(response.error.len(), 2);
        assert!(!response.succeeded());
    }

    #[test]
    fn custom_prefix_is_respected() {
        let markers = Markers::new("@@@");
        assert_eq!(classify(&markers, "@@@EXITCODE:0"), FrameLine::ExitCode(0));
        assert_eq!(
            classify(&markers, "!!!EXITCODE:0"),
            FrameLine::Data("!!!EXITCODE:0".to_string())
        );
    }
}
