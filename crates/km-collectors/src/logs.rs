//! Logs collector.
//!
//! Range-queries the log backend for the incident's selector, counts
//! matches per pattern class, and keeps a few sample stack traces.

use crate::registry::{Collector, IncidentContext};
use async_trait::async_trait;
use km_connectors::{LogLine, LogsConnector};
use km_core::{
    signal, CollectorOutput, Evidence, EvidenceData, EvidenceSource, LogPatternClass, TimeWindow,
};
use regex::Regex;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Max sample stack traces attached to the evidence.
const MAX_STACK_TRACES: usize = 5;

fn pattern_classes() -> &'static [(Regex, LogPatternClass)] {
    static PATTERNS: OnceLock<Vec<(Regex, LogPatternClass)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            (
                Regex::new(r"(?i)\b(error|err|exception|fail|failed|failure)\b").unwrap(),
                LogPatternClass::Error,
            ),
            (
                Regex::new(r"(?i)\b(panic|fatal)\b").unwrap(),
                LogPatternClass::Panic,
            ),
            (
                Regex::new(r"(?i)(OOMKilled|out of memory|OutOfMemoryError)").unwrap(),
                LogPatternClass::Oom,
            ),
            (
                Regex::new(r"(?i)(connection refused|connection reset|cannot connect)").unwrap(),
                LogPatternClass::ConnectionRefused,
            ),
            (
                Regex::new(r"(?i)(timeout|timed out|deadline exceeded)").unwrap(),
                LogPatternClass::Timeout,
            ),
            (
                Regex::new(r"\b5\d\d\b|(?i)internal server error").unwrap(),
                LogPatternClass::Http5xx,
            ),
        ]
    })
}

fn stack_trace_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"at\s+[\w.$]+\([\w.]+:\d+\)").unwrap(),
            Regex::new(r#"File "[^"]+", line \d+"#).unwrap(),
            Regex::new(r"goroutine \d+ \[.+\]:").unwrap(),
            Regex::new(r"\s+at\s+.+\s+\(.+:\d+:\d+\)").unwrap(),
        ]
    })
}

#[derive(Default)]
struct LogAnalysis {
    error_count: usize,
    patterns: Vec<LogPatternClass>,
    stack_traces: Vec<String>,
}

fn analyze(lines: &[LogLine]) -> LogAnalysis {
    let mut analysis = LogAnalysis::default();
    for entry in lines {
        for (regex, class) in pattern_classes() {
            if regex.is_match(&entry.line) {
                if !analysis.patterns.contains(class) {
                    analysis.patterns.push(*class);
                }
                if matches!(
                    class,
                    LogPatternClass::Error | LogPatternClass::Panic | LogPatternClass::Oom
                ) {
                    analysis.error_count += 1;
                }
            }
        }
        if analysis.stack_traces.len() < MAX_STACK_TRACES
            && stack_trace_patterns().iter().any(|p| p.is_match(&entry.line))
        {
            let mut trace = entry.line.clone();
            trace.truncate(1000);
            analysis.stack_traces.push(trace);
        }
    }
    analysis
}

fn signal_strength(analysis: &LogAnalysis) -> f64 {
    if analysis.patterns.contains(&LogPatternClass::Oom)
        || analysis.patterns.contains(&LogPatternClass::Panic)
    {
        return signal::TERMINAL;
    }
    if analysis.error_count > 10 {
        return signal::HIGH_RESTARTS;
    }
    if analysis.error_count > 0 {
        return signal::PRESENT;
    }
    signal::INFORMATIONAL
}

pub struct LogsCollector {
    logs: Arc<dyn LogsConnector>,
}

impl LogsCollector {
    pub fn new(logs: Arc<dyn LogsConnector>) -> Self {
        Self { logs }
    }
}

#[async_trait]
impl Collector for LogsCollector {
    fn name(&self) -> &str {
        "logs"
    }

    async fn collect(&self, ctx: &IncidentContext, window: TimeWindow) -> CollectorOutput {
        let mut out = CollectorOutput::new(self.name());
        let lines = match self
            .logs
            .query_range(&ctx.namespace, ctx.service.as_deref(), window)
            .await
        {
            Ok(lines) => lines,
            Err(e) => {
                out.errors.push(format!("log query: {}", e));
                out.partial = true;
                return out;
            }
        };

        let analysis = analyze(&lines);
        let minutes = window.duration_minutes().max(1.0);
        let error_rate = analysis.error_count as f64 / minutes;
        let strength = signal_strength(&analysis);
        let entity = ctx.service.clone().unwrap_or_else(|| "all".to_string());

        debug!(
            lines = lines.len(),
            errors = analysis.error_count,
            rate = error_rate,
            "log analysis complete"
        );

        out.evidence.push(
            Evidence::new(
                ctx.incident_id,
                EvidenceSource::Logs,
                &entity,
                &ctx.namespace,
                EvidenceData::LogsPattern {
                    total_lines: lines.len(),
                    error_count: analysis.error_count,
                    patterns: analysis.patterns,
                    error_rate_per_minute: error_rate,
                    sample_stack_traces: analysis.stack_traces,
                },
                strength,
                window,
            )
            .with_summary(format!(
                "{} lines, {} errors ({:.1}/min)",
                lines.len(),
                analysis.error_count,
                error_rate
            )),
        );
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use km_connectors::{ConnectorError, MockLogsConnector};
    use uuid::Uuid;

    fn ctx() -> IncidentContext {
        IncidentContext {
            incident_id: Uuid::new_v4(),
            cluster: "test-cluster".to_string(),
            namespace: "payments".to_string(),
            service: Some("api".to_string()),
            started_at: Utc::now(),
            deploy_lookback_minutes: 30,
        }
    }

    #[tokio::test]
    async fn test_error_patterns_counted() {
        let logs = Arc::new(MockLogsConnector::with_lines(vec![
            "Error: cannot connect to database",
            "Error: cannot connect to database",
            "connection refused by postgres:5432",
            "request served in 12ms",
        ]));
        let collector = LogsCollector::new(logs);
        let out = collector.collect(&ctx(), TimeWindow::last_minutes(15)).await;

        assert_eq!(out.evidence.len(), 1);
        match &out.evidence[0].data {
            EvidenceData::LogsPattern {
                error_count,
                patterns,
                ..
            } => {
                assert_eq!(*error_count, 2);
                assert!(patterns.contains(&LogPatternClass::Error));
                assert!(patterns.contains(&LogPatternClass::ConnectionRefused));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oom_pattern_dominates_signal() {
        let logs = Arc::new(MockLogsConnector::with_lines(vec![
            "java.lang.OutOfMemoryError: Java heap space",
        ]));
        let collector = LogsCollector::new(logs);
        let out = collector.collect(&ctx(), TimeWindow::last_minutes(15)).await;
        assert_eq!(out.evidence[0].signal_strength, signal::TERMINAL);
    }

    #[tokio::test]
    async fn test_stack_traces_capped() {
        let lines: Vec<String> = (0..10)
            .map(|i| format!("    at com.example.Service.handle(Service.java:{})", i))
            .collect();
        let logs = Arc::new(MockLogsConnector::with_lines(
            lines.iter().map(String::as_str).collect(),
        ));
        let collector = LogsCollector::new(logs);
        let out = collector.collect(&ctx(), TimeWindow::last_minutes(15)).await;
        match &out.evidence[0].data {
            EvidenceData::LogsPattern {
                sample_stack_traces,
                ..
            } => assert_eq!(sample_stack_traces.len(), MAX_STACK_TRACES),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_backend_failure_swallowed() {
        let logs = Arc::new(MockLogsConnector::new());
        logs.fail_with(ConnectorError::Unavailable("loki down".into()))
            .await;
        let collector = LogsCollector::new(logs);
        let out = collector.collect(&ctx(), TimeWindow::last_minutes(15)).await;
        assert!(out.partial);
        assert!(out.evidence.is_empty());
        assert_eq!(out.errors.len(), 1);
    }

    #[tokio::test]
    async fn test_quiet_logs_informational() {
        let logs = Arc::new(MockLogsConnector::with_lines(vec![
            "request served in 9ms",
            "request served in 11ms",
        ]));
        let collector = LogsCollector::new(logs);
        let out = collector.collect(&ctx(), TimeWindow::last_minutes(15)).await;
        assert_eq!(out.evidence[0].signal_strength, signal::INFORMATIONAL);
    }
}
