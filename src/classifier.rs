//! Request classification: an ordered rule table mapping each request to
//! exactly one caching strategy.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::request::Request;

/// Caching policy applied to a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  StaticFirst,
  CacheFirst,
  NetworkFirst,
  StaleWhileRevalidate,
  NetworkOnly,
  CacheOnly,
}

impl Strategy {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::StaticFirst => "static-first",
      Self::CacheFirst => "cache-first",
      Self::NetworkFirst => "network-first",
      Self::StaleWhileRevalidate => "stale-while-revalidate",
      Self::NetworkOnly => "network-only",
      Self::CacheOnly => "cache-only",
    }
  }
}

impl fmt::Display for Strategy {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Predicate over a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "kebab-case")]
pub enum Matcher {
  /// Any method other than GET/HEAD
  MutatingMethod,
  /// Path starts with one of the prefixes
  PathPrefix { prefixes: Vec<String> },
  /// Last path segment has one of the extensions (compared lowercase)
  Extension { extensions: Vec<String> },
  /// Request declares a page navigation
  Navigation,
  /// Matches if any inner matcher does
  AnyOf { matchers: Vec<Matcher> },
}

impl Matcher {
  pub fn matches(&self, request: &Request) -> bool {
    match self {
      Self::MutatingMethod => request.is_mutating(),
      Self::PathPrefix { prefixes } => {
        let path = request.path();
        prefixes.iter().any(|p| path.starts_with(p.as_str()))
      }
      Self::Extension { extensions } => match request.extension() {
        Some(ext) => extensions.iter().any(|e| e.eq_ignore_ascii_case(&ext)),
        None => false,
      },
      Self::Navigation => request.is_navigation(),
      Self::AnyOf { matchers } => matchers.iter().any(|m| m.matches(request)),
    }
  }
}

/// One entry of the rule table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyRule {
  pub matcher: Matcher,
  pub strategy: Strategy,
}

impl StrategyRule {
  pub fn new(matcher: Matcher, strategy: Strategy) -> Self {
    Self { matcher, strategy }
  }
}

pub fn path_prefix(values: &[&str]) -> Matcher {
  Matcher::PathPrefix {
    prefixes: values.iter().map(|s| s.to_string()).collect(),
  }
}

pub fn extension(values: &[&str]) -> Matcher {
  Matcher::Extension {
    extensions: values.iter().map(|s| s.to_string()).collect(),
  }
}

/// The default rule table, in precedence order.
pub fn default_rules() -> Vec<StrategyRule> {
  vec![
    // Mutations are never cached
    StrategyRule::new(Matcher::MutatingMethod, Strategy::NetworkOnly),
    // Build internals and identity endpoints
    StrategyRule::new(
      path_prefix(&["/_next/", "/api/auth/", "/auth/", "/login", "/logout"]),
      Strategy::NetworkOnly,
    ),
    StrategyRule::new(
      extension(&["css", "js", "mjs", "woff", "woff2", "ttf", "otf", "eot"]),
      Strategy::StaticFirst,
    ),
    StrategyRule::new(
      Matcher::AnyOf {
        matchers: vec![
          extension(&["png", "jpg", "jpeg", "gif", "webp", "avif", "svg", "ico"]),
          path_prefix(&["/images/", "/uploads/"]),
        ],
      },
      Strategy::CacheFirst,
    ),
    StrategyRule::new(path_prefix(&["/api/"]), Strategy::StaleWhileRevalidate),
    StrategyRule::new(Matcher::Navigation, Strategy::NetworkOnly),
  ]
}

/// Evaluates rules in order; the first match wins.
#[derive(Debug, Clone)]
pub struct Classifier {
  rules: Vec<StrategyRule>,
  fallback: Strategy,
}

impl Classifier {
  pub fn new(rules: Vec<StrategyRule>) -> Self {
    Self {
      rules,
      fallback: Strategy::NetworkFirst,
    }
  }

  pub fn rules(&self) -> &[StrategyRule] {
    &self.rules
  }

  pub fn classify(&self, request: &Request) -> Strategy {
    self
      .rules
      .iter()
      .find(|rule| rule.matcher.matches(request))
      .map(|rule| rule.strategy)
      .unwrap_or(self.fallback)
  }
}

impl Default for Classifier {
  fn default() -> Self {
    Self::new(default_rules())
  }
}
