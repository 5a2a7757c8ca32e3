//! Per-language launch commands, error-catching templates and script invocation.

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::framing::Markers;

/// Characters of an error trace kept in a response.
pub const TRACE_LIMIT: usize = 2000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Language {
    Matlab,
    Julia,
    R,
    Python,
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::Matlab => "matlab",
            Language::Julia => "julia",
            Language::R => "r",
            Language::Python => "python",
        };
        f.write_str(name)
    }
}

const PYTHON_DRIVER: &str = r#"import sys, traceback
_dp_buf = []
for _dp_line in sys.stdin:
    _dp_line = _dp_line.rstrip("\n")
    if _dp_line == "@EXEC@":
        _dp_code = "\n".join(_dp_buf)
        _dp_buf = []
        try:
            exec(compile(_dp_code, "<datapool>", "exec"), globals())
        except BaseException:
            print("@PREFIX@ERROR:START")
            print(traceback.format_exc()[-@LIMIT@:])
            print("@PREFIX@ERROR:END")
            print("@PREFIX@EXITCODE:1")
            print("@PREFIX@FINISHED", flush=True)
    else:
        _dp_buf.append(_dp_line)
"#;

const PYTHON_TEMPLATE: &str = r#"try:
@SNIPPET@
    _dp_exit_code = 0
except Exception:
    _dp_exit_code = 1
    print("@PREFIX@ERROR:START")
    print(traceback.format_exc()[-@LIMIT@:])
    print("@PREFIX@ERROR:END")
print("@PREFIX@EXITCODE:%d" % _dp_exit_code)
print("@PREFIX@FINISHED", flush=True)"#;

const JULIA_DRIVER: &str = r#"const _dp_buf = String[]
for _dp_line in eachline(stdin)
    if _dp_line == "@EXEC@"
        _dp_code = join(_dp_buf, "\n")
        empty!(_dp_buf)
        try
            include_string(Main, _dp_code)
        catch _dp_err
            println("@PREFIX@ERROR:START")
            showerror(stdout, _dp_err)
            println()
            println("@PREFIX@ERROR:END")
            println("@PREFIX@EXITCODE:1")
            println("@PREFIX@FINISHED")
        end
        flush(stdout)
    else
        push!(_dp_buf, _dp_line)
    end
end
"#;

const JULIA_TEMPLATE: &str = r#"_dp_exit_code = try
@SNIPPET@
    0
catch _dp_err
    println("@PREFIX@ERROR:START")
    println(first(sprint(showerror, _dp_err, catch_backtrace()), @LIMIT@))
    println("@PREFIX@ERROR:END")
    1
end
println("@PREFIX@EXITCODE:", _dp_exit_code)
println("@PREFIX@FINISHED")
flush(stdout)"#;

const R_DRIVER: &str = r#".dp_con <- file("stdin", open = "r")
.dp_buf <- character(0)
repeat {
  .dp_line <- readLines(.dp_con, n = 1)
  if (length(.dp_line) == 0) break
  if (.dp_line == "@EXEC@") {
    .dp_code <- paste(.dp_buf, collapse = "\n")
    .dp_buf <- character(0)
    tryCatch(eval(parse(text = .dp_code), envir = globalenv()), error = function(e) {
      cat("@PREFIX@ERROR:START\n")
      cat(conditionMessage(e), "\n")
      cat("@PREFIX@ERROR:END\n")
      cat("@PREFIX@EXITCODE:1\n")
      cat("@PREFIX@FINISHED\n")
    })
    flush(stdout())
  } else {
    .dp_buf <- c(.dp_buf, .dp_line)
  }
}
"#;

const R_TEMPLATE: &str = r#".dp_exit_code <- tryCatch({
@SNIPPET@
  0L
}, error = function(e) {
  cat("@PREFIX@ERROR:START\n")
  .dp_trace <- paste(c(conditionMessage(e), deparse(conditionCall(e))), collapse = "\n")
  cat(substr(.dp_trace, 1, @LIMIT@), "\n")
  cat("@PREFIX@ERROR:END\n")
  1L
})
cat(sprintf("@PREFIX@EXITCODE:%d\n", .dp_exit_code))
cat("@PREFIX@FINISHED\n")
flush(stdout())"#;

const MATLAB_TEMPLATE: &str = "dp_exit_code = 0; try, @SNIPPET@; catch dp_err, dp_exit_code = 1; \
disp('@PREFIX@ERROR:START'); dp_trace = getReport(dp_err, 'extended', 'hyperlinks', 'off'); \
disp(dp_trace(1:min(end, @LIMIT@))); disp('@PREFIX@ERROR:END'); end; \
disp(sprintf('@PREFIX@EXITCODE:%d', dp_exit_code)); disp('@PREFIX@FINISHED');";

fn fill(template: &str, markers: &Markers, snippet: &str) -> String {
    template
        .replace("@PREFIX@", markers.prefix())
        .replace("@EXEC@", &markers.exec())
        .replace("@LIMIT@", &TRACE_LIMIT.to_string())
        .replace("@SNIPPET@", snippet)
}

fn indent(snippet: &str, by: &str) -> String {
    snippet
        .lines()
        .map(|line| format!("{by}{line}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Double-quoted string literal for Python, Julia and R; only Julia interpolates `$`.
fn quote_double(text: &str, escape_dollar: bool) -> String {
    let mut out = String::with_capacity(text.len() + 2);
    out.push('"');
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '$' if escape_dollar => out.push_str("\\$"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

fn quote_matlab(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

impl Language {
    pub const ALL: [Language; 4] = [
        Language::Matlab,
        Language::Julia,
        Language::R,
        Language::Python,
    ];

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "m" => Some(Language::Matlab),
            "jl" => Some(Language::Julia),
            "r" | "R" => Some(Language::R),
            "py" => Some(Language::Python),
            _ => None,
        }
    }

    pub fn for_script(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Language::Matlab => "m",
            Language::Julia => "jl",
            Language::R => "r",
            Language::Python => "py",
        }
    }

    /// File name a conversion script must carry; Matlab resolves functions by file name.
    pub fn required_script_name(self) -> String {
        format!("conversion.{}", self.extension())
    }

    pub fn default_program(self) -> &'static str {
        match self {
            Language::Matlab => "matlab",
            Language::Julia => "julia",
            Language::R => "Rscript",
            Language::Python => "python3",
        }
    }

    pub fn noop(self) -> &'static str {
        match self {
            Language::Matlab => "0;",
            Language::Julia => "nothing",
            Language::R => "0",
            Language::Python => "0",
        }
    }

    /// Arguments that start the interpreter reading framed blocks from stdin.
    pub fn launch_args(self, markers: &Markers) -> Vec<String> {
        match self {
            Language::Matlab => vec![
                "-nodisplay".to_string(),
                "-nosplash".to_string(),
                "-nodesktop".to_string(),
            ],
            Language::Julia => vec![
                "--startup-file=no".to_string(),
                "--color=no".to_string(),
                "-e".to_string(),
                fill(JULIA_DRIVER, markers, ""),
            ],
            Language::R => vec![
                "--vanilla".to_string(),
                "-e".to_string(),
                fill(R_DRIVER, markers, ""),
            ],
            Language::Python => vec![
                "-u".to_string(),
                "-c".to_string(),
                fill(PYTHON_DRIVER, markers, ""),
            ],
        }
    }

    /// Wrap a snippet so it reports an exit code, errors and the end of its output.
    pub fn wrap(self, snippet: &str, markers: &Markers) -> String {
        match self {
            Language::Python => fill(PYTHON_TEMPLATE, markers, &indent(snippet, "    ")),
            Language::Julia => fill(JULIA_TEMPLATE, markers, &indent(snippet, "    ")),
            Language::R => fill(R_TEMPLATE, markers, &indent(snippet, "  ")),
            Language::Matlab => {
                let one_line = snippet
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .collect::<Vec<_>>()
                    .join(" ");
                fill(MATLAB_TEMPLATE, markers, &one_line)
            }
        }
    }

    /// Text written to stdin for one wrapped snippet.
    pub fn submission(self, wrapped: &str, markers: &Markers) -> String {
        match self {
            Language::Matlab => format!("{wrapped}\n"),
            _ => format!("{wrapped}\n{}\n", markers.exec()),
        }
    }

    /// Snippet calling `convert(input, output)` defined by the script.
    pub fn run_script_snippet(self, script: &Path, input: &Path, output: &Path) -> String {
        let script_s = script.to_string_lossy();
        let input_s = input.to_string_lossy();
        let output_s = output.to_string_lossy();
        match self {
            Language::Python => format!(
                "import importlib.util as _dp_util\n\
                 _dp_spec = _dp_util.spec_from_file_location(\"_dp_conversion\", {})\n\
                 _dp_module = _dp_util.module_from_spec(_dp_spec)\n\
                 _dp_spec.loader.exec_module(_dp_module)\n\
                 _dp_module.convert({}, {})",
                quote_double(&script_s, false),
                quote_double(&input_s, false),
                quote_double(&output_s, false)
            ),
            Language::Julia => format!(
                "_dp_module = Module(:DatapoolConversion)\n\
                 Base.include(_dp_module, {})\n\
                 Base.invokelatest(_dp_module.convert, {}, {})",
                quote_double(&script_s, true),
                quote_double(&input_s, true),
                quote_double(&output_s, true)
            ),
            Language::R => format!(
                ".dp_env <- new.env()\n\
                 sys.source({}, envir = .dp_env)\n\
                 .dp_env$convert({}, {})",
                quote_double(&script_s, false),
                quote_double(&input_s, false),
                quote_double(&output_s, false)
            ),
            Language::Matlab => {
                let folder = script
                    .parent()
                    .map(|p| p.to_string_lossy().to_string())
                    .unwrap_or_else(|| ".".to_string());
                format!(
                    "dp_old_path = addpath({}); try, conversion({}, {}); catch dp_inner, \
                     path(dp_old_path); rethrow(dp_inner); end; path(dp_old_path);",
                    quote_matlab(&folder),
                    quote_matlab(&input_s),
                    quote_matlab(&output_s)
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extensions_roundtrip() {
        for language in Language::ALL {
            assert_eq!(Language::from_extension(language.extension()), Some(language));
        }
        assert_eq!(Language::for_script(Path::new("a/conversion.txt")), None);
    }

    #[test]
    fn python_template_indents_snippet_inside_try() {
        let wrapped = Language::Python.wrap("x = 1\ny = x + 1", &Markers::default());
        assert!(wrapped.starts_with("try:\n    x = 1\n    y = x + 1\n"));
        assert!(wrapped.contains("print(\"!!!EXITCODE:%d\" % _dp_exit_code)"));
        assert!(wrapped.ends_with("print(\"!!!FINISHED\", flush=True)"));
    }

    #[test]
    fn submissions_end_with_exec_terminator_except_matlab() {
        let markers = Markers::default();
        assert!(Language::R.submission("0", &markers).ends_with("!!!EXEC\n"));
        assert_eq!(Language::Matlab.submission("0;", &markers), "0;\n");
    }

    #[test]
    fn matlab_wrap_is_a_single_line() {
        let snippet = Language::Matlab.run_script_snippet(
            Path::new("/zone/data/acme/conversion.m"),
            Path::new("/tmp/in.raw"),
            Path::new("/tmp/it's.csv"),
        );
        let wrapped = Language::Matlab.wrap(&snippet, &Markers::default());
        assert!(!wrapped.contains('\n'));
        assert!(wrapped.contains("addpath('/zone/data/acme')"));
        assert!(wrapped.contains("'/tmp/it''s.csv'"));
    }

    #[test]
    fn double_quoting_escapes_backslashes_and_julia_interpolation() {
        assert_eq!(quote_double(r#"C:\a "$b""#, true), r#""C:\\a \"\$b\"""#);
        assert_eq!(quote_double(r#"C:\a "$b""#, false), r#""C:\\a \"$b\"""#);
    }
}
