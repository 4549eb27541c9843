use bincode::de::Decoder;
use bincode::enc::Encoder;
use bincode::error::{DecodeError, EncodeError};
use bincode::{Decode, Encode};
use regex::Regex;
use serde::Serialize;
use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt;
use std::sync::{Arc, LazyLock};
use thiserror::Error;

/// Errors raised while configuring failure fingerprinting.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FailureError {
    /// The trace bound was negative.
    #[error("max trace size must be non-negative, got {0}")]
    NegativeTraceSize(i64),
}

/// One frame of a call stack as reported by the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Encode, Decode, Serialize)]
pub struct StackFrame {
    /// Module path (or impl block) that declares the symbol, e.g. `demo::tokenizer`.
    pub declaring_unit: String,
    /// Last path segment of the symbol, e.g. `next_token`.
    pub symbol: String,
    pub source: Option<String>,
    pub line: Option<u32>,
}

impl StackFrame {
    /// Builds a frame from a fully qualified symbol path, splitting it at the
    /// last `::` that is not nested inside angle brackets.
    pub fn from_symbol_path(path: &str, source: Option<String>, line: Option<u32>) -> Self {
        let (declaring_unit, symbol) = split_symbol_path(path);
        Self {
            declaring_unit: declaring_unit.to_string(),
            symbol: symbol.to_string(),
            source,
            line,
        }
    }

    /// `declaring_unit::symbol`, or just the symbol when there is no unit.
    pub fn qualified_name(&self) -> String {
        if self.declaring_unit.is_empty() {
            self.symbol.clone()
        } else {
            format!("{}::{}", self.declaring_unit, self.symbol)
        }
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.qualified_name())?;
        match (&self.source, self.line) {
            (Some(source), Some(line)) => write!(f, " ({source}:{line})"),
            (Some(source), None) => write!(f, " ({source})"),
            _ => write!(f, " (unknown source)"),
        }
    }
}

fn split_symbol_path(path: &str) -> (&str, &str) {
    let bytes = path.as_bytes();
    let mut depth = 0usize;
    let mut split_at = None;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'<' => depth += 1,
            b'>' => depth = depth.saturating_sub(1),
            b':' if depth == 0 && bytes.get(i + 1) == Some(&b':') => {
                split_at = Some(i);
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }
    match split_at {
        Some(idx) => (&path[..idx], &path[idx + 2..]),
        None => ("", path),
    }
}

/// Deepest cause chain carried on the wire. Longer chains keep their
/// outermost levels plus the root when encoded.
pub const MAX_CAUSE_DEPTH: usize = 64;

/// An error observed while running one input, as transmitted by the worker.
///
/// The `cause` chain mirrors the source chain of the original error; the
/// innermost link is the root cause and is the one that carries frames.
///
/// On the wire the chain is a flat, length-prefixed list of levels,
/// outermost first, so decoding never recurses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedError {
    pub type_name: String,
    pub message: String,
    pub frames: Vec<StackFrame>,
    pub cause: Option<Box<RaisedError>>,
}

impl RaisedError {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
            frames: Vec::new(),
            cause: None,
        }
    }

    pub fn with_frames(mut self, frames: Vec<StackFrame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn caused_by(mut self, cause: RaisedError) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Follows `cause` links to the terminal error.
    pub fn root_cause(&self) -> &RaisedError {
        let mut current = self;
        while let Some(next) = current.cause.as_deref() {
            current = next;
        }
        current
    }

    /// Describes a caught panic. Frames come from the captured backtrace when
    /// one is available, otherwise from the panic location alone.
    pub fn from_panic(
        message: impl Into<String>,
        backtrace: Option<&Backtrace>,
        location: Option<(String, u32)>,
    ) -> Self {
        let mut frames = backtrace.map(frames_from_backtrace).unwrap_or_default();
        if frames.is_empty() {
            if let Some((file, line)) = location {
                frames.push(StackFrame {
                    declaring_unit: String::new(),
                    symbol: "<panic>".to_string(),
                    source: Some(file),
                    line: Some(line),
                });
            }
        }
        RaisedError::new("panic", message).with_frames(frames)
    }

    /// Converts an `anyhow` error chain. Each link of the chain becomes one
    /// level; the backtrace captured by `anyhow` is attached to the root.
    pub fn from_error(err: &anyhow::Error) -> Self {
        let links: Vec<&(dyn std::error::Error + 'static)> = err.chain().collect();
        let frames = frames_from_backtrace(err.backtrace());

        let mut raised: Option<RaisedError> = None;
        for (depth, link) in links.iter().enumerate().rev() {
            let mut level = RaisedError::new(error_type_name(*link), link.to_string());
            if depth == links.len() - 1 {
                level.frames = frames.clone();
            }
            if let Some(inner) = raised.take() {
                level = level.caused_by(inner);
            }
            raised = Some(level);
        }
        raised.unwrap_or_else(|| RaisedError::new("error", err.to_string()))
    }
}

impl RaisedError {
    fn wire_levels(&self) -> Vec<&RaisedError> {
        let mut levels: Vec<&RaisedError> =
            std::iter::successors(Some(self), |level| level.cause.as_deref()).collect();
        if levels.len() > MAX_CAUSE_DEPTH {
            if let Some(root) = levels.pop() {
                levels.truncate(MAX_CAUSE_DEPTH - 1);
                levels.push(root);
            }
        }
        levels
    }
}

impl Encode for RaisedError {
    fn encode<E: Encoder>(&self, encoder: &mut E) -> Result<(), EncodeError> {
        let levels = self.wire_levels();
        (levels.len() as u64).encode(encoder)?;
        for level in levels {
            level.type_name.encode(encoder)?;
            level.message.encode(encoder)?;
            level.frames.encode(encoder)?;
        }
        Ok(())
    }
}

impl<Context> Decode<Context> for RaisedError {
    fn decode<D: Decoder<Context = Context>>(decoder: &mut D) -> Result<Self, DecodeError> {
        let depth = u64::decode(decoder)?;
        if depth == 0 || depth > MAX_CAUSE_DEPTH as u64 {
            return Err(DecodeError::OtherString(format!(
                "cause chain depth {depth} outside 1..={MAX_CAUSE_DEPTH}"
            )));
        }
        let mut levels = Vec::with_capacity(depth as usize);
        for _ in 0..depth {
            levels.push(RaisedError {
                type_name: String::decode(decoder)?,
                message: String::decode(decoder)?,
                frames: Vec::<StackFrame>::decode(decoder)?,
                cause: None,
            });
        }

        let mut chain: Option<RaisedError> = None;
        for mut level in levels.into_iter().rev() {
            level.cause = chain.take().map(Box::new);
            chain = Some(level);
        }
        chain.ok_or(DecodeError::Other("empty cause chain"))
    }
}

bincode::impl_borrow_decode!(RaisedError);

impl fmt::Display for RaisedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.type_name, self.message)
    }
}

/// Best-effort type name for one link of an error chain.
///
/// `dyn Error` carries no type name, so common std error types are found by
/// downcasting. Anything else falls back to the leading path of its `Debug`
/// rendering: the struct name for derived structs, but only the variant name
/// for enums (`NotFound` rather than `LookupError::NotFound`).
fn error_type_name(err: &(dyn std::error::Error + 'static)) -> String {
    if let Some(name) = std_error_name(err) {
        return name.to_string();
    }
    let rendered = format!("{err:?}");
    let name: String = rendered
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();
    if name.is_empty() {
        "error".to_string()
    } else {
        name
    }
}

fn std_error_name(err: &(dyn std::error::Error + 'static)) -> Option<&'static str> {
    if err.is::<std::io::Error>() {
        Some("std::io::Error")
    } else if err.is::<fmt::Error>() {
        Some("std::fmt::Error")
    } else if err.is::<std::num::ParseIntError>() {
        Some("std::num::ParseIntError")
    } else if err.is::<std::num::ParseFloatError>() {
        Some("std::num::ParseFloatError")
    } else if err.is::<std::str::Utf8Error>() {
        Some("std::str::Utf8Error")
    } else if err.is::<std::string::FromUtf8Error>() {
        Some("std::string::FromUtf8Error")
    } else {
        None
    }
}

static FRAME_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+:\s+(\S.*?)\s*$").expect("valid frame regex"));
static LOCATION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*at\s+(.+?):(\d+)(?::\d+)?\s*$").expect("valid location regex")
});
static SYMBOL_HASH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"::h[0-9a-f]{16}$").expect("valid hash regex"));

/// Frames of a captured backtrace, innermost first. Uncaptured backtraces
/// yield no frames.
pub fn frames_from_backtrace(backtrace: &Backtrace) -> Vec<StackFrame> {
    if backtrace.status() != BacktraceStatus::Captured {
        return Vec::new();
    }
    parse_backtrace(&backtrace.to_string())
}

/// Parses the textual rendering of `std::backtrace::Backtrace`.
pub fn parse_backtrace(text: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    let mut awaiting_location = false;
    for line in text.lines() {
        if let Some(caps) = FRAME_LINE.captures(line) {
            let symbol = SYMBOL_HASH.replace(&caps[1], "");
            frames.push(StackFrame::from_symbol_path(&symbol, None, None));
            awaiting_location = true;
        } else if let Some(caps) = LOCATION_LINE.captures(line) {
            if !awaiting_location {
                continue;
            }
            if let Some(frame) = frames.last_mut() {
                frame.source = Some(caps[1].to_string());
                frame.line = caps[2].parse().ok();
            }
            awaiting_location = false;
        }
    }
    frames
}

/// Decides which frames belong to the engine itself rather than to the target.
pub trait FramePredicate: Send + Sync {
    fn is_internal(&self, frame: &StackFrame) -> bool;
}

impl<F> FramePredicate for F
where
    F: Fn(&StackFrame) -> bool + Send + Sync,
{
    fn is_internal(&self, frame: &StackFrame) -> bool {
        self(frame)
    }
}

const RUNNER_PREFIXES: &[&str] = &[
    "forkline_core::worker",
    "<forkline_core::worker",
    "std::panic",
    "core::panic",
    "std::rt",
    "std::sys",
    "std::backtrace",
    "std::thread",
    "core::ops::function",
    "<core::panic",
    "<alloc::boxed::Box",
    "<std::panic",
    "anyhow::",
    "<anyhow::",
    "__rust",
    "rust_begin_unwind",
    "__libc_start",
    "_start",
    "main",
];

/// Frames from the worker runner and from the standard library's panic and
/// startup machinery.
#[derive(Debug, Clone)]
pub struct RunnerFrames {
    prefixes: Vec<String>,
}

impl RunnerFrames {
    pub fn new() -> Self {
        Self {
            prefixes: RUNNER_PREFIXES.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Adds extra qualified-name prefixes to treat as internal.
    pub fn with_prefixes<I, S>(mut self, extra: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.prefixes.extend(extra.into_iter().map(Into::into));
        self
    }
}

impl Default for RunnerFrames {
    fn default() -> Self {
        Self::new()
    }
}

impl FramePredicate for RunnerFrames {
    fn is_internal(&self, frame: &StackFrame) -> bool {
        let name = frame.qualified_name();
        // Trait impls such as `<F as forkline_core::worker::Harness>::run`.
        if name.contains(" as forkline_core::worker::") {
            return true;
        }
        self.prefixes.iter().any(|prefix| {
            if prefix == "main" {
                name == "main"
            } else {
                name.starts_with(prefix.as_str())
            }
        })
    }
}

/// The comparable fingerprint of a failure: root cause type plus its cleaned,
/// bounded frames. Messages are deliberately not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Failure {
    pub root_type: String,
    pub frames: Vec<StackFrame>,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.root_type)?;
        for frame in &self.frames {
            write!(f, "\n    at {frame}")?;
        }
        Ok(())
    }
}

/// Reduces raised errors to bounded fingerprints.
#[derive(Clone)]
pub struct StackCleaner {
    max_trace_size: usize,
    internal: Arc<dyn FramePredicate>,
}

impl StackCleaner {
    pub fn new(max_trace_size: i64) -> Result<Self, FailureError> {
        let max_trace_size = usize::try_from(max_trace_size)
            .map_err(|_| FailureError::NegativeTraceSize(max_trace_size))?;
        Ok(Self {
            max_trace_size,
            internal: Arc::new(RunnerFrames::new()),
        })
    }

    pub fn with_internal_frames(mut self, predicate: impl FramePredicate + 'static) -> Self {
        self.internal = Arc::new(predicate);
        self
    }

    pub fn max_trace_size(&self) -> usize {
        self.max_trace_size
    }

    pub fn clean(&self, error: &RaisedError) -> Failure {
        let root = error.root_cause();
        let frames = root
            .frames
            .iter()
            .filter(|frame| !self.internal.is_internal(frame))
            .take(self.max_trace_size)
            .cloned()
            .collect();
        Failure {
            root_type: root.type_name.clone(),
            frames,
        }
    }
}

impl fmt::Debug for StackCleaner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackCleaner")
            .field("max_trace_size", &self.max_trace_size)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(path: &str, line: u32) -> StackFrame {
        StackFrame::from_symbol_path(path, Some("src/lib.rs".to_string()), Some(line))
    }

    fn target_error(message: &str) -> RaisedError {
        RaisedError::new("ParseError", message).with_frames(vec![
            frame("std::panicking::begin_panic", 1),
            frame("demo::tokenizer::next_token", 42),
            frame("demo::parser::parse", 17),
            frame("forkline_core::worker::Worker::run_one", 200),
            frame("demo::entry", 3),
        ])
    }

    #[test]
    fn negative_trace_size_is_rejected() {
        assert_eq!(
            StackCleaner::new(-1).unwrap_err(),
            FailureError::NegativeTraceSize(-1)
        );
        assert!(StackCleaner::new(0).is_ok());
    }

    #[test]
    fn clean_uses_root_cause_and_drops_runner_frames() {
        let cleaner = StackCleaner::new(10).unwrap();
        let wrapped = RaisedError::new("Context", "while parsing").caused_by(target_error("bad"));
        let failure = cleaner.clean(&wrapped);

        assert_eq!(failure.root_type, "ParseError");
        let names: Vec<String> = failure.frames.iter().map(|f| f.qualified_name()).collect();
        assert_eq!(
            names,
            vec![
                "demo::tokenizer::next_token",
                "demo::parser::parse",
                "demo::entry"
            ]
        );
    }

    #[test]
    fn fingerprint_ignores_message_text() {
        let cleaner = StackCleaner::new(3).unwrap();
        let a = cleaner.clean(&target_error("unexpected ')' at 4"));
        let b = cleaner.clean(&target_error("unexpected '}' at 19"));
        assert_eq!(a, b);

        let mut other = target_error("unexpected ')' at 4");
        other.type_name = "LexError".to_string();
        assert_ne!(a, cleaner.clean(&other));
    }

    #[test]
    fn frame_count_never_exceeds_bound() {
        let error = target_error("x");
        for size in 0..8 {
            let cleaner = StackCleaner::new(size).unwrap();
            let failure = cleaner.clean(&error);
            assert!(failure.frames.len() <= size as usize, "size {size}");
        }
        let failure = StackCleaner::new(1).unwrap().clean(&error);
        assert_eq!(failure.frames[0].symbol, "next_token");
    }

    #[test]
    fn custom_predicate_replaces_runner_frames() {
        let cleaner = StackCleaner::new(10)
            .unwrap()
            .with_internal_frames(|f: &StackFrame| f.declaring_unit.starts_with("demo::parser"));
        let failure = cleaner.clean(&target_error("x"));
        assert_eq!(failure.frames.len(), 4);
        assert!(failure.frames.iter().all(|f| f.symbol != "parse"));
    }

    #[test]
    fn runner_frames_accepts_extra_prefixes() {
        let runner = RunnerFrames::new().with_prefixes(["demo::parser"]);
        assert!(runner.is_internal(&frame("demo::parser::parse", 1)));
        assert!(runner.is_internal(&frame("core::panicking::panic_fmt", 1)));
        assert!(!runner.is_internal(&frame("demo::tokenizer::next_token", 1)));
        assert!(!runner.is_internal(&frame("demo::main", 1)));
    }

    #[test]
    fn symbol_paths_split_outside_generics() {
        let f = StackFrame::from_symbol_path("<demo::Lexer as core::iter::Iterator>::next", None, None);
        assert_eq!(f.declaring_unit, "<demo::Lexer as core::iter::Iterator>");
        assert_eq!(f.symbol, "next");

        let f = StackFrame::from_symbol_path("rust_begin_unwind", None, None);
        assert_eq!(f.declaring_unit, "");
        assert_eq!(f.symbol, "rust_begin_unwind");
    }

    #[test]
    fn parses_std_backtrace_text() {
        let text = "   0: std::backtrace::Backtrace::force_capture
             at /rustc/abc/library/std/src/backtrace.rs:312:13
   1: demo::tokenizer::next_token::h0123456789abcdef
             at ./src/tokenizer.rs:42:9
   2: demo::parser::parse
   3: demo::main
             at ./src/main.rs:7:5
";
        let frames = parse_backtrace(text);
        assert_eq!(frames.len(), 4);
        assert_eq!(frames[1].qualified_name(), "demo::tokenizer::next_token");
        assert_eq!(frames[1].source.as_deref(), Some("./src/tokenizer.rs"));
        assert_eq!(frames[1].line, Some(42));
        assert_eq!(frames[2].source, None);
        assert_eq!(frames[3].line, Some(7));
    }

    #[test]
    fn panic_without_backtrace_falls_back_to_location() {
        let raised =
            RaisedError::from_panic("boom", None, Some(("src/demo.rs".to_string(), 12)));
        assert_eq!(raised.type_name, "panic");
        assert_eq!(raised.frames.len(), 1);
        assert_eq!(raised.frames[0].line, Some(12));
    }

    #[test]
    fn anyhow_chain_becomes_cause_levels() {
        let parse_err = "x1".parse::<u32>().unwrap_err();
        let err = anyhow::Error::new(parse_err).context("reading header");
        let raised = RaisedError::from_error(&err);

        assert_eq!(raised.message, "reading header");
        let root = raised.root_cause();
        assert_eq!(root.type_name, "std::num::ParseIntError");
        assert!(root.message.contains("invalid digit"));
        assert!(raised.cause.is_some());
    }

    #[test]
    fn io_errors_keep_their_type_name_whatever_the_repr() {
        let os = std::io::Error::from_raw_os_error(2);
        let custom = std::io::Error::new(std::io::ErrorKind::NotFound, "unit file gone");
        let simple = std::io::Error::from(std::io::ErrorKind::NotFound);
        for io_err in [os, custom, simple] {
            let err = anyhow::Error::new(io_err).context("loading units");
            let raised = RaisedError::from_error(&err);
            assert_eq!(raised.root_cause().type_name, "std::io::Error");
        }
    }

    #[derive(Debug)]
    enum LookupError {
        Missing,
    }

    impl fmt::Display for LookupError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "lookup failed")
        }
    }

    impl std::error::Error for LookupError {}

    #[test]
    fn enum_errors_fall_back_to_variant_name() {
        let raised = RaisedError::from_error(&anyhow::Error::new(LookupError::Missing));
        assert_eq!(raised.type_name, "Missing");
    }

    fn chain_depth(error: &RaisedError) -> usize {
        std::iter::successors(Some(error), |level| level.cause.as_deref()).count()
    }

    #[test]
    fn wire_form_bounds_cause_depth_and_keeps_root() {
        let mut raised = target_error("root message");
        for level in 0..200 {
            raised = RaisedError::new("Context", format!("level {level}")).caused_by(raised);
        }
        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&raised, config).unwrap();
        let (decoded, _): (RaisedError, usize) =
            bincode::decode_from_slice(&bytes, config).unwrap();

        assert_eq!(chain_depth(&decoded), MAX_CAUSE_DEPTH);
        assert_eq!(decoded.message, "level 199");
        assert_eq!(decoded.root_cause(), raised.root_cause());
    }

    #[test]
    fn wire_form_keeps_short_chains_intact() {
        let raised = RaisedError::new("Context", "outer")
            .caused_by(RaisedError::new("Middle", "middle").caused_by(target_error("root")));
        let config = bincode::config::standard();
        let bytes = bincode::encode_to_vec(&raised, config).unwrap();
        let (decoded, _): (RaisedError, usize) =
            bincode::decode_from_slice(&bytes, config).unwrap();
        assert_eq!(decoded, raised);
    }

    #[test]
    fn oversized_or_empty_depth_is_rejected() {
        let config = bincode::config::standard();
        for depth in [0u64, MAX_CAUSE_DEPTH as u64 + 1, 1_000_000] {
            let bytes = bincode::encode_to_vec(depth, config).unwrap();
            let result: Result<(RaisedError, usize), _> =
                bincode::decode_from_slice(&bytes, config);
            assert!(result.is_err(), "depth {depth} accepted");
        }
    }
}
