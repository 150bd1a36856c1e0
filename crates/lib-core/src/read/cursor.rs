use std::fmt::Write;

use knotd_store::Dateline;

use crate::error::EngineError;

/// Decoded cursor: where a paginated read stopped and how to resume it.
/// The text form is opaque to clients but deliberately printable:
/// `cursor:off=<n>;dl=<dateline>[;sp=<n>][;it=<frozen iterator>]`.
/// The iterator field comes last because frozen state may itself contain
/// separators.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CursorState {
    /// Matches already delivered.
    pub offset: u64,
    /// Append horizon when the cursor was cut; replays are exact only if
    /// the store has not moved past it.
    pub dateline: Dateline,
    /// Position in the sorted buffer, for sorted reads.
    pub sort_pos: Option<u64>,
    /// The set iterator, frozen, for unsorted reads.
    pub frozen_iter: Option<String>,
}

impl CursorState {
    pub fn render(&self) -> String {
        let mut out = String::from("cursor:");
        let _ = write!(out, "off={};dl={}", self.offset, self.dateline);
        if let Some(sp) = self.sort_pos {
            let _ = write!(out, ";sp={sp}");
        }
        if let Some(it) = &self.frozen_iter {
            let _ = write!(out, ";it={it}");
        }
        out
    }

    pub fn parse(text: &str) -> Result<CursorState, EngineError> {
        let bad = || EngineError::semantics(format!("malformed cursor `{text}`"));
        let mut rest = text.strip_prefix("cursor:").ok_or_else(bad)?;
        let mut state = CursorState::default();
        let mut saw_offset = false;
        while !rest.is_empty() {
            if let Some(it) = rest.strip_prefix("it=") {
                state.frozen_iter = Some(it.to_string());
                break;
            }
            let (field, tail) = match rest.split_once(';') {
                Some((field, tail)) => (field, tail),
                None => (rest, ""),
            };
            rest = tail;
            let (key, value) = field.split_once('=').ok_or_else(bad)?;
            match key {
                "off" => {
                    state.offset = value.parse().map_err(|_| bad())?;
                    saw_offset = true;
                }
                "dl" => state.dateline = value.parse().map_err(|_| bad())?,
                "sp" => state.sort_pos = Some(value.parse().map_err(|_| bad())?),
                _ => return Err(bad()),
            }
        }
        if !saw_offset {
            return Err(bad());
        }
        Ok(state)
    }
}

#[cfg(test)]
mod tests {
    use knotd_store::LocalId;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn unsorted_cursor_round_trips() {
        let state = CursorState {
            offset: 10,
            dateline: Dateline::single(0x7f, LocalId::new(120)),
            sort_pos: None,
            frozen_iter: Some("without:{fixed:1,2@1}{null:}@-".to_string()),
        };
        let text = state.render();
        assert_eq!(CursorState::parse(&text).unwrap(), state);
    }

    #[test]
    fn sorted_cursor_round_trips() {
        let state = CursorState {
            offset: 30,
            dateline: Dateline::single(1, LocalId::new(99)),
            sort_pos: Some(30),
            frozen_iter: None,
        };
        assert_eq!(CursorState::parse(&state.render()).unwrap(), state);
    }

    #[test]
    fn malformed_cursors_are_semantic_errors() {
        for text in ["", "cursor:", "cursor:dl=zz", "cursor:off=x", "elsewhere:off=1"] {
            let err = CursorState::parse(text).unwrap_err();
            assert_eq!(err.code(), "SEMANTICS", "{text:?}");
        }
    }
}
