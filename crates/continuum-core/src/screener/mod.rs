//! Code Screener: a pure, fast, fallible-never predicate run before a
//! claimed task's script reaches the sandbox.

/// Analyzes script text and classifies it as malicious or benign.
///
/// Implementations must be pure and must never panic; on ambiguity they
/// should return `false` (benign) rather than block forward progress.
pub trait Screener: Send + Sync {
    fn analyze(&self, script: &str) -> bool;
}

// Compile-time assertion: Screener must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Screener) {}
};

/// A small literal-substring deny-list screener.
///
/// This is a stand-in for a real rule engine: the upstream source leaves
/// `AnalyzeCode` unimplemented (always benign). Shipping a minimal but
/// real rule set here means the loop never has to change when a fuller
/// engine replaces it -- only the `Screener` impl does.
#[derive(Debug, Clone)]
pub struct DenyListScreener {
    patterns: Vec<String>,
}

impl DenyListScreener {
    /// The default deny-list: obvious probe markers, not a serious
    /// security boundary.
    pub fn default_patterns() -> Vec<String> {
        vec![
            "__pwn__".to_string(),
            "/etc/shadow".to_string(),
            "os.system(\"rm -rf".to_string(),
        ]
    }

    pub fn new(patterns: Vec<String>) -> Self {
        Self { patterns }
    }
}

impl Default for DenyListScreener {
    fn default() -> Self {
        Self::new(Self::default_patterns())
    }
}

impl Screener for DenyListScreener {
    fn analyze(&self, script: &str) -> bool {
        self.patterns.iter().any(|pat| script.contains(pat.as_str()))
    }
}
