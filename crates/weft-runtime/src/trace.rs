//! The schedule trace: an ordered log of every scheduling decision and
//! nondeterministic choice made during one iteration.
//!
//! The textual form is line-based and stable so that a trace captured from a
//! failed run can be replayed later:
//!
//! ```text
//! # comment
//! SCHED 0
//! BOOL 1
//! INT 3
//! ```

use std::fmt;

use crate::operation::OperationId;

/// One recorded decision.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum TraceEntry {
    /// Operation with this id was scheduled next.
    Schedule(u64),
    /// A nondeterministic boolean choice.
    Boolean(bool),
    /// A nondeterministic integer choice.
    Integer(u64),
}

/// Append-only sequence of decisions for one iteration.
#[derive(Clone, Debug, Default)]
pub struct ScheduleTrace {
    entries: Vec<TraceEntry>,
}

impl ScheduleTrace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_schedule(&mut self, op: OperationId) {
        self.entries.push(TraceEntry::Schedule(op.get()));
    }

    pub fn push_boolean(&mut self, value: bool) {
        self.entries.push(TraceEntry::Boolean(value));
    }

    pub fn push_integer(&mut self, value: u64) {
        self.entries.push(TraceEntry::Integer(value));
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Parse the textual form produced by [`serialize`](Self::serialize).
    ///
    /// The parser tolerates extra whitespace, blank lines, and `#` comments.
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        let mut entries = Vec::new();

        for (lineno, line) in text.lines().enumerate() {
            let line = match line.split_once('#') {
                Some((before, _)) => before.trim(),
                None => line.trim(),
            };

            if line.is_empty() {
                continue;
            }

            let mut fields = line.split_whitespace();
            let kind = fields.next().expect("non-empty line has a first field");
            let value = match fields.next() {
                Some(value) => value,
                None => anyhow::bail!("line {}: `{kind}` is missing its value", lineno + 1),
            };

            if let Some(extra) = fields.next() {
                anyhow::bail!("line {}: unexpected trailing field `{extra}`", lineno + 1);
            }

            let entry = match kind {
                "SCHED" => TraceEntry::Schedule(value.parse().map_err(|e| {
                    anyhow::anyhow!("line {}: invalid operation id `{value}`: {e}", lineno + 1)
                })?),
                "BOOL" => match value {
                    "0" => TraceEntry::Boolean(false),
                    "1" => TraceEntry::Boolean(true),
                    _ => anyhow::bail!(
                        "line {}: boolean value must be 0 or 1, got `{value}`",
                        lineno + 1
                    ),
                },
                "INT" => TraceEntry::Integer(value.parse().map_err(|e| {
                    anyhow::anyhow!("line {}: invalid integer `{value}`: {e}", lineno + 1)
                })?),
                _ => anyhow::bail!("line {}: unknown entry kind `{kind}`", lineno + 1),
            };

            entries.push(entry);
        }

        Ok(Self { entries })
    }

    /// Serialize to the textual form. Serializing, parsing, and serializing
    /// again yields a byte-identical result.
    pub fn serialize(&self) -> String {
        let mut out = String::with_capacity(self.entries.len() * 8);
        for entry in &self.entries {
            match entry {
                TraceEntry::Schedule(id) => {
                    out.push_str("SCHED ");
                    out.push_str(&id.to_string());
                }
                TraceEntry::Boolean(value) => {
                    out.push_str("BOOL ");
                    out.push(if *value { '1' } else { '0' });
                }
                TraceEntry::Integer(value) => {
                    out.push_str("INT ");
                    out.push_str(&value.to_string());
                }
            }
            out.push('\n');
        }

        out
    }
}

impl fmt::Display for ScheduleTrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serialize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_parse_round_trip_is_byte_identical() {
        let mut trace = ScheduleTrace::new();
        trace.push_schedule(OperationId::new(0));
        trace.push_boolean(true);
        trace.push_schedule(OperationId::new(3));
        trace.push_integer(17);
        trace.push_boolean(false);

        let first = trace.serialize();
        let parsed = ScheduleTrace::parse(&first).unwrap();
        let second = parsed.serialize();

        assert_eq!(first, second);
        assert_eq!(parsed.entries(), trace.entries());
    }

    #[test]
    fn parse_tolerates_whitespace_and_comments() {
        let text = "\n  # a captured schedule\n\n  SCHED   2  \nBOOL 0 # inline comment\n\tINT 9\n";
        let trace = ScheduleTrace::parse(text).unwrap();

        assert_eq!(
            trace.entries(),
            &[
                TraceEntry::Schedule(2),
                TraceEntry::Boolean(false),
                TraceEntry::Integer(9),
            ]
        );
    }

    #[test]
    fn parse_rejects_malformed_lines() {
        assert!(ScheduleTrace::parse("SCHED").is_err());
        assert!(ScheduleTrace::parse("SCHED x").is_err());
        assert!(ScheduleTrace::parse("BOOL 2").is_err());
        assert!(ScheduleTrace::parse("WAT 1").is_err());
        assert!(ScheduleTrace::parse("INT 1 2").is_err());
    }

    #[test]
    fn empty_input_parses_to_empty_trace() {
        let trace = ScheduleTrace::parse("# nothing here\n").unwrap();
        assert!(trace.is_empty());
    }
}
