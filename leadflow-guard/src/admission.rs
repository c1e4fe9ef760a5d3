//! Query admission gate.
//!
//! Cheap lexical heuristics over the query text: brace-nesting depth and a
//! token-weighted complexity score. This is a pre-filter for pathological
//! queries, not a cost model; execution still needs its own time limit.

use leadflow_core::{AdmissionRejected, QueryConfig};
use serde::{Deserialize, Serialize};

/// Weight of each opening brace in the complexity score.
const BRACE_WEIGHT: u32 = 2;
/// Weight of each `query` keyword.
const QUERY_WEIGHT: u32 = 10;
/// Weight of each `fragment` keyword.
const FRAGMENT_WEIGHT: u32 = 5;

/// Share of a limit above which the analysis carries a warning.
const WARN_RATIO: f64 = 0.8;

/// Coarse complexity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl ComplexityLevel {
    pub fn from_score(score: u32) -> Self {
        match score {
            0..=9 => ComplexityLevel::Low,
            10..=49 => ComplexityLevel::Medium,
            50..=100 => ComplexityLevel::High,
            _ => ComplexityLevel::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLevel::Low => "low",
            ComplexityLevel::Medium => "medium",
            ComplexityLevel::High => "high",
            ComplexityLevel::Critical => "critical",
        }
    }

    pub const ALL: [ComplexityLevel; 4] = [
        ComplexityLevel::Low,
        ComplexityLevel::Medium,
        ComplexityLevel::High,
        ComplexityLevel::Critical,
    ];
}

/// Result of analyzing one query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryAnalysis {
    pub depth: u32,
    pub complexity: u32,
    pub level: ComplexityLevel,
    /// False when braces are unbalanced.
    pub is_valid: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token<'a> {
    Open,
    Close,
    /// `(` opening an argument or variable list.
    Args,
    Word(&'a str),
}

/// Split a query into braces, argument list openers and identifier words, skipping string
/// literals and `#` comments.
fn tokens(query: &str) -> Vec<Token<'_>> {
    let bytes = query.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'{' => {
                out.push(Token::Open);
                i += 1;
            }
            b'}' => {
                out.push(Token::Close);
                i += 1;
            }
            b'(' => {
                out.push(Token::Args);
                i += 1;
            }
            b'#' => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
            }
            b'"' => {
                i += 1;
                while i < bytes.len() && bytes[i] != b'"' {
                    if bytes[i] == b'\\' {
                        i += 1;
                    }
                    i += 1;
                }
                i += 1;
            }
            b if b.is_ascii_alphabetic() || b == b'_' => {
                let start = i;
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'_') {
                    i += 1;
                }
                out.push(Token::Word(&query[start..i]));
            }
            _ => i += 1,
        }
    }
    out
}

/// Name of the first operation in `query`, if it is named.
///
/// Only the operation header before the first `{` is considered, so
/// anonymous operations and shorthand queries yield `None`.
pub fn operation_name(query: &str) -> Option<String> {
    let mut header = tokens(query).into_iter().take_while(|t| *t != Token::Open);
    loop {
        match header.next()? {
            Token::Word("query" | "mutation" | "subscription") => {
                return match header.next()? {
                    Token::Word(name) => Some(name.to_string()),
                    _ => None,
                };
            }
            _ => continue,
        }
    }
}

/// Depth and complexity analyzer with admission limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryComplexityAnalyzer {
    max_depth: u32,
    max_complexity: u32,
}

impl QueryComplexityAnalyzer {
    pub fn new(max_depth: u32, max_complexity: u32) -> Self {
        Self {
            max_depth,
            max_complexity,
        }
    }

    pub fn from_config(config: &QueryConfig) -> Self {
        Self::new(config.max_depth, config.max_complexity)
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn max_complexity(&self) -> u32 {
        self.max_complexity
    }

    pub fn analyze(&self, query: &str) -> QueryAnalysis {
        let mut depth: i64 = 0;
        let mut max_depth: i64 = 0;
        let mut balanced = true;
        let mut complexity: u32 = 0;

        for token in tokens(query) {
            match token {
                Token::Open => {
                    depth += 1;
                    max_depth = max_depth.max(depth);
                    complexity = complexity.saturating_add(BRACE_WEIGHT);
                }
                Token::Close => {
                    depth -= 1;
                    if depth < 0 {
                        balanced = false;
                    }
                }
                Token::Word("query") => complexity = complexity.saturating_add(QUERY_WEIGHT),
                Token::Word("fragment") => {
                    complexity = complexity.saturating_add(FRAGMENT_WEIGHT)
                }
                Token::Word(_) | Token::Args => {}
            }
        }
        let is_valid = balanced && depth == 0;
        let depth = u32::try_from(max_depth).unwrap_or(u32::MAX);

        let mut warnings = Vec::new();
        if !is_valid {
            warnings.push("Query has unbalanced braces".to_string());
        }
        if depth <= self.max_depth && f64::from(depth) > f64::from(self.max_depth) * WARN_RATIO {
            warnings.push(format!(
                "Query depth {} is close to limit {}",
                depth, self.max_depth
            ));
        }
        if complexity <= self.max_complexity
            && f64::from(complexity) > f64::from(self.max_complexity) * WARN_RATIO
        {
            warnings.push(format!(
                "Query complexity {} is close to limit {}",
                complexity, self.max_complexity
            ));
        }

        QueryAnalysis {
            depth,
            complexity,
            level: ComplexityLevel::from_score(complexity),
            is_valid,
            warnings,
        }
    }

    /// Admit or reject `query`.
    pub fn should_allow(&self, query: &str) -> Result<QueryAnalysis, AdmissionRejected> {
        let analysis = self.analyze(query);

        let reason = if !analysis.is_valid {
            Some("Query has unbalanced braces".to_string())
        } else if analysis.depth > self.max_depth {
            Some(format!(
                "Query depth {} exceeds limit {}",
                analysis.depth, self.max_depth
            ))
        } else if analysis.complexity > self.max_complexity {
            Some(format!(
                "Query complexity {} exceeds limit {}",
                analysis.complexity, self.max_complexity
            ))
        } else {
            None
        };

        match reason {
            Some(reason) => Err(AdmissionRejected {
                depth: analysis.depth,
                complexity: analysis.complexity,
                max_depth: self.max_depth,
                max_complexity: self.max_complexity,
                reason,
            }),
            None => Ok(analysis),
        }
    }
}

impl Default for QueryComplexityAnalyzer {
    fn default() -> Self {
        Self::from_config(&QueryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    /// `query { a { b { ... } } }` with `levels` nested selection sets.
    fn nested(levels: usize) -> String {
        let mut q = String::from("query Deep ");
        for i in 0..levels {
            q.push_str(&format!("{{ f{} ", i));
        }
        for _ in 0..levels {
            q.push_str("} ");
        }
        q
    }

    #[test]
    fn test_depth_counts_nesting() {
        let analyzer = QueryComplexityAnalyzer::default();
        let analysis = analyzer.analyze("query { user { id posts { title } } }");
        assert_eq!(analysis.depth, 3);
        assert!(analysis.is_valid);
    }

    #[test]
    fn test_complexity_score() {
        let analyzer = QueryComplexityAnalyzer::default();
        // 3 braces * 2 + query * 10 + fragment * 5
        let q = "query Q { user { ...F } } fragment F on User { id }";
        let analysis = analyzer.analyze(q);
        assert_eq!(analysis.complexity, 3 * 2 + 10 + 5);
        assert_eq!(analysis.level, ComplexityLevel::Medium);
    }

    #[test]
    fn test_keywords_inside_names_do_not_count() {
        let analyzer = QueryComplexityAnalyzer::default();
        let analysis = analyzer.analyze("{ searchQuery queryCount fragments }");
        assert_eq!(analysis.complexity, 2);
    }

    #[test]
    fn test_strings_and_comments_are_skipped() {
        let analyzer = QueryComplexityAnalyzer::default();
        let q = "# query { { {\nquery { search(term: \"{{{ \\\" query\") { id } }";
        let analysis = analyzer.analyze(q);
        assert_eq!(analysis.depth, 2);
        assert_eq!(analysis.complexity, 2 * 2 + 10);
        assert!(analysis.is_valid);
    }

    #[test]
    fn test_rejects_depth_over_limit() {
        let analyzer = QueryComplexityAnalyzer::new(7, 1000);
        let err = analyzer
            .should_allow(&nested(9))
            .expect_err("depth 9 must be rejected");
        assert_eq!(err.depth, 9);
        assert_eq!(err.max_depth, 7);
        assert_eq!(err.reason, "Query depth 9 exceeds limit 7");
    }

    #[test]
    fn test_rejects_complexity_over_limit() {
        let analyzer = QueryComplexityAnalyzer::new(20, 30);
        let err = analyzer
            .should_allow(&nested(12))
            .expect_err("complexity 34 must be rejected");
        assert_eq!(err.complexity, 12 * 2 + 10);
        assert_eq!(err.reason, "Query complexity 34 exceeds limit 30");
    }

    #[test]
    fn test_allows_within_limits_with_warning() {
        let analyzer = QueryComplexityAnalyzer::new(7, 100);
        let analysis = analyzer.should_allow(&nested(7)).expect("depth 7 is allowed");
        assert_eq!(analysis.depth, 7);
        assert!(analysis.warnings.iter().any(|w| w.contains("close to limit 7")));
    }

    #[test]
    fn test_rejects_unbalanced() {
        let analyzer = QueryComplexityAnalyzer::default();
        assert!(analyzer.should_allow("query { user { id }").is_err());
        assert!(analyzer.should_allow("query } {").is_err());
    }

    #[test]
    fn test_level_boundaries() {
        assert_eq!(ComplexityLevel::from_score(9), ComplexityLevel::Low);
        assert_eq!(ComplexityLevel::from_score(10), ComplexityLevel::Medium);
        assert_eq!(ComplexityLevel::from_score(50), ComplexityLevel::High);
        assert_eq!(ComplexityLevel::from_score(100), ComplexityLevel::High);
        assert_eq!(ComplexityLevel::from_score(101), ComplexityLevel::Critical);
    }

    #[test]
    fn test_operation_name() {
        assert_eq!(
            operation_name("query GetLeads($id: ID!) { leads { id } }").as_deref(),
            Some("GetLeads")
        );
        assert_eq!(
            operation_name("# comment\nmutation Score { score }").as_deref(),
            Some("Score")
        );
        assert_eq!(operation_name("{ leads { id } }"), None);
        assert_eq!(operation_name("query { leads { id } }"), None);
        assert_eq!(operation_name("mutation($id: ID!) { archive(id: $id) }"), None);
        assert_eq!(operation_name("{ query { id } }"), None);
    }

    proptest! {
        #[test]
        fn prop_nested_depth_is_exact(levels in 0usize..40) {
            let analyzer = QueryComplexityAnalyzer::new(100, 10_000);
            let analysis = analyzer.analyze(&nested(levels));
            prop_assert_eq!(analysis.depth as usize, levels);
            prop_assert_eq!(analysis.complexity as usize, levels * 2 + 10);
            prop_assert!(analysis.is_valid);
        }

        #[test]
        fn prop_analyze_never_panics(query in ".{0,200}") {
            let analyzer = QueryComplexityAnalyzer::default();
            let _ = analyzer.analyze(&query);
            let _ = operation_name(&query);
        }
    }
}
