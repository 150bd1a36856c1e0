use knotd_store::{Guid, Linkage, Timestamp, ValueType};
use smol_str::SmolStr;
use strum_macros::EnumString;

use crate::constraint::{
    Asof, Assignment, Constraint, ConstraintId, ConstraintSet, FieldMask, KeyField, LinkRel,
    SortDir, SortKey, Tri, ValueOp,
};
use crate::error::EngineError;
use crate::lexer::{Token, TokenKind, tokenize};
use crate::pattern::Pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Read,
    Iterate,
    Write,
}

/// A parsed request: the kind and the root of a freshly-built constraint
/// tree, not yet semantically completed.
#[derive(Debug)]
pub struct ParsedRequest {
    pub kind: RequestKind,
    pub constraints: ConstraintSet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "kebab-case")]
enum Keyword {
    Type,
    Name,
    Value,
    Typeguid,
    Left,
    Right,
    Scope,
    Guid,
    Newest,
    Oldest,
    Timestamp,
    Live,
    Archival,
    Anchor,
    Key,
    Unique,
    Sort,
    Result,
    Pagesize,
    Countlimit,
    Resultpagesize,
    Start,
    Count,
    Cursor,
    Dateline,
    Asof,
    Comparator,
    ValueComparator,
    Datatype,
    Optional,
}

pub fn parse_request(src: &str) -> Result<ParsedRequest, EngineError> {
    let tokens = tokenize(src)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        set: ConstraintSet::new(),
    };

    let kind = match parser.expect_word()?.as_str() {
        "read" => RequestKind::Read,
        "iterate" => RequestKind::Iterate,
        "write" => RequestKind::Write,
        other => {
            return Err(EngineError::syntax(
                0,
                format!("unknown request type `{other}`"),
            ));
        }
    };

    parser.expect(TokenKind::Open)?;
    let root = parser.constraint(None)?;
    if parser.set.node(root).alt.is_some() {
        return Err(EngineError::syntax(0, "the root constraint has no alternative"));
    }
    parser.set.set_root(root);
    if parser.pos != parser.tokens.len() {
        let at = parser.tokens[parser.pos].at;
        return Err(EngineError::syntax(at, "trailing input after request"));
    }

    Ok(ParsedRequest {
        kind,
        constraints: parser.set,
    })
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    set: ConstraintSet,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn peek_kind(&self) -> Option<TokenKind> {
        self.peek().map(|t| t.kind)
    }

    fn bump(&mut self) -> Result<&'a Token, EngineError> {
        let token = self.tokens.get(self.pos).ok_or_else(|| {
            let at = self.tokens.last().map_or(0, |t| t.at);
            EngineError::syntax(at, "unexpected end of request")
        })?;
        self.pos += 1;
        Ok(token)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<&'a Token, EngineError> {
        let token = self.bump()?;
        if token.kind != kind {
            return Err(EngineError::syntax(
                token.at,
                format!("expected {kind:?}, found `{token}`"),
            ));
        }
        Ok(token)
    }

    fn expect_word(&mut self) -> Result<&'a String, EngineError> {
        Ok(&self.expect(TokenKind::Word)?.text)
    }

    /// True if `self.tokens[self.pos]` immediately follows the previous
    /// token, with no whitespace. Distinguishes `left->` from `left ->`.
    fn adjacent(&self, prev: &Token, prev_width: usize) -> bool {
        self.peek().is_some_and(|t| t.at == prev.at + prev_width)
    }

    /// Parse the body of a constraint, the opening `(` already consumed.
    /// Returns the head of the or-chain if a `|` alternative follows.
    fn constraint(&mut self, parent: Option<ConstraintId>) -> Result<ConstraintId, EngineError> {
        let mut con = Constraint::new();
        con.parent = parent;
        let id = self.set.alloc(con);

        loop {
            let token = self.bump()?;
            match token.kind {
                TokenKind::Close => break,
                TokenKind::Open => {
                    let child = self.constraint(Some(id))?;
                    self.set.node_mut(id).children.push(child);
                }
                TokenKind::ArrowRight => {
                    // Bare `->`: left is inferred by semantic completion.
                    self.set_rel(id, token.at, LinkRel::MyLinkageToParent(Linkage::Left), true)?;
                }
                TokenKind::ArrowLeft => {
                    if self.peek_kind() == Some(TokenKind::Word) && self.adjacent(token, 2) {
                        let word = self.bump()?;
                        let l: Linkage = word.text.parse().map_err(|_| {
                            EngineError::syntax(
                                word.at,
                                format!("`<-` needs a linkage, found `{}`", word.text),
                            )
                        })?;
                        self.set_rel(id, token.at, LinkRel::ParentLinkageToMe(l), false)?;
                    } else {
                        self.set_rel(
                            id,
                            token.at,
                            LinkRel::MyLinkageToParent(Linkage::Right),
                            true,
                        )?;
                    }
                }
                TokenKind::Variable => {
                    let var: SmolStr = token.text.as_str().into();
                    self.expect(TokenKind::Eq)?;
                    let pattern = self.pattern_atom()?;
                    self.set.node_mut(id).assignments.push(Assignment {
                        var,
                        pattern,
                        declared_at: None,
                    });
                }
                TokenKind::Word => {
                    // `left->` style relation marker?
                    if self.peek_kind() == Some(TokenKind::ArrowRight)
                        && self.adjacent(token, token.text.len())
                        && let Ok(l) = token.text.parse::<Linkage>()
                    {
                        self.bump()?;
                        self.set_rel(id, token.at, LinkRel::MyLinkageToParent(l), false)?;
                        continue;
                    }
                    self.clause(id, token)?;
                }
                _ => {
                    return Err(EngineError::syntax(
                        token.at,
                        format!("unexpected `{token}` in constraint"),
                    ));
                }
            }
        }

        // `| ( … )` — tail alternative of an or-branch.
        if self.peek_kind() == Some(TokenKind::Pipe) {
            self.bump()?;
            self.expect(TokenKind::Open)?;
            let tail = self.constraint(parent)?;
            self.set.node_mut(id).alt = Some(tail);
            self.set.node_mut(tail).alt_of = Some(id);
        }

        Ok(id)
    }

    fn set_rel(
        &mut self,
        id: ConstraintId,
        at: usize,
        rel: LinkRel,
        inferred: bool,
    ) -> Result<(), EngineError> {
        let node = self.set.node_mut(id);
        if node.rel.is_some() {
            return Err(EngineError::syntax(at, "constraint has two parent linkages"));
        }
        if node.parent.is_none() {
            return Err(EngineError::syntax(at, "root constraint has no parent to link"));
        }
        node.rel = Some(rel);
        node.rel_inferred = inferred;
        Ok(())
    }

    fn clause(&mut self, id: ConstraintId, word: &Token) -> Result<(), EngineError> {
        let keyword: Keyword = word.text.parse().map_err(|_| {
            EngineError::syntax(word.at, format!("unknown keyword `{}`", word.text))
        })?;

        if keyword == Keyword::Optional {
            self.set.node_mut(id).count_min = 0;
            return Ok(());
        }

        let op_token = self.bump()?;
        let op = match op_token.kind {
            TokenKind::Eq => ValueOp::Eq,
            TokenKind::Ne => ValueOp::Ne,
            TokenKind::Match => ValueOp::Match,
            TokenKind::Lt => ValueOp::Lt,
            TokenKind::Le => ValueOp::Le,
            TokenKind::Gt => ValueOp::Gt,
            TokenKind::Ge => ValueOp::Ge,
            _ => {
                return Err(EngineError::syntax(
                    op_token.at,
                    format!("expected an operator after `{}`", word.text),
                ));
            }
        };
        let eq_only = |op: ValueOp, what: &str| -> Result<(), EngineError> {
            if op == ValueOp::Eq {
                Ok(())
            } else {
                Err(EngineError::syntax(
                    op_token.at,
                    format!("`{what}` only accepts `=`"),
                ))
            }
        };

        match keyword {
            Keyword::Type => {
                eq_only(op, "type")?;
                for text in self.string_operands()? {
                    self.set.node_mut(id).type_names.push(text);
                }
            }
            Keyword::Name => {
                let operand = self.scalar_operand()?;
                self.set.node_mut(id).name.push(op, operand);
            }
            Keyword::Value => {
                let operand = self.scalar_operand()?;
                self.set.node_mut(id).value.push(op, operand);
            }
            Keyword::Guid => self.guid_clause(id, op, op_token.at, None)?,
            Keyword::Typeguid => {
                self.guid_clause(id, op, op_token.at, Some(Linkage::Typeguid))?
            }
            Keyword::Left => self.guid_clause(id, op, op_token.at, Some(Linkage::Left))?,
            Keyword::Right => self.guid_clause(id, op, op_token.at, Some(Linkage::Right))?,
            Keyword::Scope => self.guid_clause(id, op, op_token.at, Some(Linkage::Scope))?,
            Keyword::Newest => {
                eq_only(op, "newest")?;
                self.set.node_mut(id).newest = self.generation_operand()?;
            }
            Keyword::Oldest => {
                eq_only(op, "oldest")?;
                self.set.node_mut(id).oldest = self.generation_operand()?;
            }
            Keyword::Timestamp => {
                let t = self.timestamp_operand()?;
                let node = self.set.node_mut(id);
                match op {
                    ValueOp::Lt => node.timestamp_max = Some((t, false)),
                    ValueOp::Le => node.timestamp_max = Some((t, true)),
                    ValueOp::Gt => node.timestamp_min = Some((t, false)),
                    ValueOp::Ge => node.timestamp_min = Some((t, true)),
                    ValueOp::Eq => {
                        node.timestamp_min = Some((t, true));
                        node.timestamp_max = Some((t, true));
                    }
                    _ => {
                        return Err(EngineError::syntax(
                            op_token.at,
                            "timestamp accepts `=`, `<`, `<=`, `>`, `>=`",
                        ));
                    }
                }
            }
            Keyword::Live => {
                eq_only(op, "live")?;
                self.set.node_mut(id).live = self.tri_operand()?;
            }
            Keyword::Archival => {
                eq_only(op, "archival")?;
                self.set.node_mut(id).archival = self.tri_operand()?;
            }
            Keyword::Anchor => {
                eq_only(op, "anchor")?;
                let word = self.expect_word()?;
                self.set.node_mut(id).anchor = match word.as_str() {
                    "true" => crate::constraint::AnchorMode::Anchor,
                    "false" => crate::constraint::AnchorMode::NoAnchor,
                    "local" => crate::constraint::AnchorMode::AnchorLocal,
                    other => {
                        return Err(EngineError::syntax(
                            op_token.at,
                            format!("anchor is true, false, or local, not `{other}`"),
                        ));
                    }
                };
            }
            Keyword::Key => {
                eq_only(op, "key")?;
                self.set.node_mut(id).key_mask = self.field_mask()?;
            }
            Keyword::Unique => {
                eq_only(op, "unique")?;
                self.set.node_mut(id).unique_mask = self.field_mask()?;
            }
            Keyword::Sort => {
                eq_only(op, "sort")?;
                self.set.node_mut(id).sort = self.sort_keys()?;
            }
            Keyword::Result => {
                eq_only(op, "result")?;
                let pattern = self.pattern_atom()?;
                self.set.node_mut(id).result = Some(pattern);
            }
            Keyword::Pagesize => {
                eq_only(op, "pagesize")?;
                self.set.node_mut(id).pagesize = Some(self.number()?);
            }
            Keyword::Countlimit => {
                eq_only(op, "countlimit")?;
                self.set.node_mut(id).countlimit = Some(self.number()?);
            }
            Keyword::Resultpagesize => {
                eq_only(op, "resultpagesize")?;
                self.set.node_mut(id).resultpagesize = Some(self.number()?);
            }
            Keyword::Start => {
                eq_only(op, "start")?;
                self.set.node_mut(id).start = self.number()?;
            }
            Keyword::Count => {
                let n = self.number()?;
                let node = self.set.node_mut(id);
                match op {
                    ValueOp::Eq => {
                        node.count_min = n;
                        node.count_max = Some(n);
                    }
                    ValueOp::Ge | ValueOp::Gt => {
                        node.count_min = if op == ValueOp::Gt { n + 1 } else { n };
                    }
                    ValueOp::Le => node.count_max = Some(n),
                    ValueOp::Lt => node.count_max = Some(n.saturating_sub(1)),
                    _ => {
                        return Err(EngineError::syntax(
                            op_token.at,
                            "count accepts `=`, `<`, `<=`, `>`, `>=`",
                        ));
                    }
                }
            }
            Keyword::Cursor => {
                eq_only(op, "cursor")?;
                let text = self.expect(TokenKind::String)?;
                self.set.node_mut(id).cursor = Some(text.text.as_str().into());
            }
            Keyword::Dateline | Keyword::Asof => {
                eq_only(op, "asof")?;
                let token = self.bump()?;
                let asof = match token.kind {
                    TokenKind::Word => Asof::Timestamp(token.text.parse().map_err(|_| {
                        EngineError::syntax(token.at, "asof wants a timestamp or dateline")
                    })?),
                    TokenKind::String => {
                        Asof::Dateline(token.text.parse().map_err(|_| {
                            EngineError::syntax(token.at, "malformed dateline")
                        })?)
                    }
                    _ => {
                        return Err(EngineError::syntax(
                            token.at,
                            "asof wants a timestamp or dateline",
                        ));
                    }
                };
                self.set.node_mut(id).asof = Some(asof);
            }
            Keyword::Comparator => {
                eq_only(op, "comparator")?;
                self.set.node_mut(id).comparator = self.comparator_operand()?;
            }
            Keyword::ValueComparator => {
                eq_only(op, "value-comparator")?;
                self.set.node_mut(id).value_comparator = self.comparator_operand()?;
            }
            Keyword::Datatype => {
                eq_only(op, "datatype")?;
                let word = self.bump()?;
                let vt: ValueType = word.text.parse().map_err(|_| {
                    EngineError::syntax(word.at, format!("unknown datatype `{}`", word.text))
                })?;
                self.set.node_mut(id).datatype = Some(vt);
            }
            Keyword::Optional => unreachable!("handled above"),
        }
        Ok(())
    }

    fn guid_clause(
        &mut self,
        id: ConstraintId,
        op: ValueOp,
        at: usize,
        linkage: Option<Linkage>,
    ) -> Result<(), EngineError> {
        let operands = self.guid_operands()?;
        let node = self.set.node_mut(id);
        let spec = match linkage {
            Some(l) => &mut node.linkage[l.index()],
            None => &mut node.guid,
        };
        match op {
            ValueOp::Eq => spec.intersect_eq(operands),
            ValueOp::Ne => spec.ne.extend(operands),
            ValueOp::Match => {
                for g in operands {
                    match g {
                        Some(g) => spec.lineage.push(g),
                        None => {
                            return Err(EngineError::syntax(at, "`~=` cannot match null"));
                        }
                    }
                }
            }
            _ => {
                return Err(EngineError::syntax(at, "guids accept `=`, `!=`, `~=`"));
            }
        }
        Ok(())
    }

    /// `"str"`, `null`, or `("a" "b")`.
    fn string_operands(&mut self) -> Result<Vec<SmolStr>, EngineError> {
        let token = self.bump()?;
        match token.kind {
            TokenKind::String => Ok(vec![token.text.as_str().into()]),
            TokenKind::Open => {
                let mut out = Vec::new();
                loop {
                    let token = self.bump()?;
                    match token.kind {
                        TokenKind::Close => break,
                        TokenKind::String => out.push(token.text.as_str().into()),
                        _ => {
                            return Err(EngineError::syntax(
                                token.at,
                                format!("expected a string, found `{token}`"),
                            ));
                        }
                    }
                }
                Ok(out)
            }
            _ => Err(EngineError::syntax(
                token.at,
                format!("expected a string, found `{token}`"),
            )),
        }
    }

    /// `"str"` or `null`.
    fn scalar_operand(&mut self) -> Result<Option<SmolStr>, EngineError> {
        let token = self.bump()?;
        match token.kind {
            TokenKind::String => Ok(Some(token.text.as_str().into())),
            TokenKind::Word if token.text == "null" => Ok(None),
            _ => Err(EngineError::syntax(
                token.at,
                format!("expected a string or null, found `{token}`"),
            )),
        }
    }

    fn guid_atom(token: &Token) -> Result<Option<Guid>, EngineError> {
        if token.text == "null" {
            return Ok(None);
        }
        token
            .text
            .parse::<Guid>()
            .map(Some)
            .map_err(|_| EngineError::syntax(token.at, format!("bad guid `{}`", token.text)))
    }

    fn guid_operands(&mut self) -> Result<Vec<Option<Guid>>, EngineError> {
        let token = self.bump()?;
        match token.kind {
            TokenKind::Word => Ok(vec![Self::guid_atom(token)?]),
            TokenKind::Open => {
                let mut out = Vec::new();
                loop {
                    let token = self.bump()?;
                    match token.kind {
                        TokenKind::Close => break,
                        TokenKind::Word => out.push(Self::guid_atom(token)?),
                        _ => {
                            return Err(EngineError::syntax(
                                token.at,
                                format!("expected a guid, found `{token}`"),
                            ));
                        }
                    }
                }
                Ok(out)
            }
            _ => Err(EngineError::syntax(
                token.at,
                format!("expected a guid, found `{token}`"),
            )),
        }
    }

    fn number(&mut self) -> Result<u64, EngineError> {
        let token = self.expect(TokenKind::Word)?;
        token
            .text
            .parse()
            .map_err(|_| EngineError::syntax(token.at, format!("bad number `{}`", token.text)))
    }

    fn generation_operand(&mut self) -> Result<crate::constraint::GenSpec, EngineError> {
        use crate::constraint::GenSpec;
        let token = self.expect(TokenKind::Word)?;
        if token.text == "null" || token.text == "dontcare" {
            return Ok(GenSpec::DontCare);
        }
        token
            .text
            .parse()
            .map(GenSpec::Distance)
            .map_err(|_| EngineError::syntax(token.at, format!("bad number `{}`", token.text)))
    }

    fn timestamp_operand(&mut self) -> Result<Timestamp, EngineError> {
        let token = self.expect(TokenKind::Word)?;
        token
            .text
            .parse()
            .map_err(|_| EngineError::syntax(token.at, format!("bad timestamp `{}`", token.text)))
    }

    fn tri_operand(&mut self) -> Result<Tri, EngineError> {
        let word = self.expect_word()?;
        match word.as_str() {
            "true" => Ok(Tri::True),
            "false" => Ok(Tri::False),
            "dontcare" => Ok(Tri::DontCare),
            other => Err(EngineError::syntax(
                self.tokens[self.pos - 1].at,
                format!("expected true, false, or dontcare, found `{other}`"),
            )),
        }
    }

    fn comparator_operand(&mut self) -> Result<crate::constraint::Comparator, EngineError> {
        let token = self.bump()?;
        let text = match token.kind {
            TokenKind::Word | TokenKind::String => token.text.as_str(),
            _ => {
                return Err(EngineError::syntax(token.at, "expected a comparator name"));
            }
        };
        text.parse()
            .map_err(|_| EngineError::syntax(token.at, format!("unknown comparator `{text}`")))
    }

    fn field_mask(&mut self) -> Result<FieldMask, EngineError> {
        let mut mask = FieldMask::EMPTY;
        let token = self.bump()?;
        match token.kind {
            TokenKind::Word => mask.set(Self::key_field(token)?),
            TokenKind::Open => loop {
                let token = self.bump()?;
                match token.kind {
                    TokenKind::Close => break,
                    TokenKind::Word => mask.set(Self::key_field(token)?),
                    _ => {
                        return Err(EngineError::syntax(
                            token.at,
                            format!("expected a field name, found `{token}`"),
                        ));
                    }
                }
            },
            _ => {
                return Err(EngineError::syntax(
                    token.at,
                    "key/unique wants a field list",
                ));
            }
        }
        Ok(mask)
    }

    fn key_field(token: &Token) -> Result<KeyField, EngineError> {
        // `type` keys on the resolved typeguid.
        if token.text == "type" {
            return Ok(KeyField::Typeguid);
        }
        token
            .text
            .parse()
            .map_err(|_| EngineError::syntax(token.at, format!("unknown field `{}`", token.text)))
    }

    fn sort_keys(&mut self) -> Result<Vec<SortKey>, EngineError> {
        let mut keys = Vec::new();
        let token = self.bump()?;
        match token.kind {
            TokenKind::Open => loop {
                match self.peek_kind() {
                    Some(TokenKind::Close) => {
                        self.bump()?;
                        break;
                    }
                    Some(TokenKind::Minus) => {
                        self.bump()?;
                        keys.push(SortKey {
                            dir: SortDir::Descending,
                            pattern: self.pattern_atom()?,
                        });
                    }
                    _ => keys.push(SortKey {
                        dir: SortDir::Ascending,
                        pattern: self.pattern_atom()?,
                    }),
                }
            },
            TokenKind::Minus => keys.push(SortKey {
                dir: SortDir::Descending,
                pattern: self.pattern_atom()?,
            }),
            _ => {
                self.pos -= 1;
                keys.push(SortKey {
                    dir: SortDir::Ascending,
                    pattern: self.pattern_atom()?,
                });
            }
        }
        Ok(keys)
    }

    fn pattern_atom(&mut self) -> Result<Pattern, EngineError> {
        let token = self.bump()?;
        match token.kind {
            TokenKind::String => Ok(Pattern::Literal(token.text.as_str().into())),
            TokenKind::Variable => Ok(Pattern::Variable(token.text.as_str().into())),
            TokenKind::Open => {
                let mut items = Vec::new();
                let mut pick = false;
                if let Some(t) = self.peek()
                    && t.kind == TokenKind::Word
                    && t.text == "pick"
                {
                    self.bump()?;
                    pick = true;
                }
                while self.peek_kind() != Some(TokenKind::Close) {
                    items.push(self.pattern_atom()?);
                }
                self.bump()?;
                Ok(if pick {
                    Pattern::Pick(items)
                } else {
                    Pattern::List(items)
                })
            }
            TokenKind::Word => Self::pattern_word(token),
            _ => Err(EngineError::syntax(
                token.at,
                format!("`{token}` cannot appear in a pattern"),
            )),
        }
    }

    fn pattern_word(token: &Token) -> Result<Pattern, EngineError> {
        Ok(match token.text.as_str() {
            "guid" => Pattern::Guid,
            "previous" => Pattern::Previous,
            "timestamp" => Pattern::Timestamp,
            "name" => Pattern::Name,
            "value" => Pattern::Value,
            "datatype" => Pattern::Datatype,
            "typeguid" => Pattern::Linkage(Linkage::Typeguid),
            "left" => Pattern::Linkage(Linkage::Left),
            "right" => Pattern::Linkage(Linkage::Right),
            "scope" => Pattern::Linkage(Linkage::Scope),
            "live" => Pattern::Live,
            "archival" => Pattern::Archival,
            "generation" => Pattern::Generation,
            "contents" => Pattern::Contents,
            "count" => Pattern::Count,
            "cursor" => Pattern::Cursor,
            "iterator" => Pattern::Iterator,
            "estimate" => Pattern::Estimate,
            "estimate-count" => Pattern::EstimateCount,
            "dateline" => Pattern::Dateline,
            other => {
                return Err(EngineError::syntax(
                    token.at,
                    format!("unknown pattern `{other}`"),
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(src: &str) -> ParsedRequest {
        parse_request(src).unwrap()
    }

    #[test]
    fn minimal_read() {
        let req = parse(r#"read (type="Person" name="Alice" result=((value)))"#);
        assert_eq!(req.kind, RequestKind::Read);
        let root = req.constraints.node(req.constraints.root());
        assert_eq!(root.type_names.as_slice(), &["Person"]);
        assert_eq!(root.name.eq_operand(), Some("Alice"));
        assert!(root.result.is_some());
    }

    #[test]
    fn write_with_key() {
        let req = parse(r#"write (type="Person" name="Alice" value="2" key=(type name))"#);
        assert_eq!(req.kind, RequestKind::Write);
        let root = req.constraints.node(req.constraints.root());
        assert!(root.key_mask.has(KeyField::Typeguid));
        assert!(root.key_mask.has(KeyField::Name));
        assert!(!root.key_mask.has(KeyField::Value));
    }

    #[test]
    fn nested_constraints_and_arrows() {
        let req = parse(r#"read (name="a" (<-left name="b") (right-> optional) (-> ))"#);
        let set = &req.constraints;
        let root = set.node(set.root());
        assert_eq!(root.children.len(), 3);
        let by_left = set.node(root.children[0]);
        assert_eq!(by_left.rel, Some(LinkRel::ParentLinkageToMe(Linkage::Left)));
        assert!(!by_left.rel_inferred);
        let by_right = set.node(root.children[1]);
        assert_eq!(by_right.rel, Some(LinkRel::MyLinkageToParent(Linkage::Right)));
        assert!(by_right.is_optional());
        let inferred = set.node(root.children[2]);
        assert!(inferred.rel_inferred);
    }

    #[test]
    fn or_alternative_chain() {
        let req = parse(r#"read (name="a" (value="1") | (value="2"))"#);
        let set = &req.constraints;
        let root = set.node(set.root());
        assert_eq!(root.children.len(), 1);
        let head = set.node(root.children[0]);
        let tail_id = head.alt.expect("head has a tail");
        assert_eq!(set.node(tail_id).alt_of, Some(root.children[0]));
        assert_eq!(set.node(tail_id).value.eq_operand(), Some("2"));
    }

    #[test]
    fn guid_sets_and_lineage() {
        let g = "00000001000000000000002a00000000";
        let req = parse(&format!("read (guid~={g} left=({g} null))"));
        let root = req.constraints.node(req.constraints.root());
        assert_eq!(root.guid.lineage.len(), 1);
        let left = &root.linkage[Linkage::Left.index()];
        assert_eq!(left.eq.as_ref().unwrap().len(), 2);
        assert!(left.eq.as_ref().unwrap().contains(&None));
    }

    #[test]
    fn sort_and_variables() {
        let req = parse(r#"read (sort=(-$x timestamp) ($x=value))"#);
        let set = &req.constraints;
        let root = set.node(set.root());
        assert_eq!(root.sort.len(), 2);
        assert_eq!(root.sort[0].dir, SortDir::Descending);
        assert_eq!(root.sort[0].pattern, Pattern::Variable("x".into()));
        let child = set.node(root.children[0]);
        assert_eq!(child.assignments.len(), 1);
        assert_eq!(child.assignments[0].pattern, Pattern::Value);
    }

    #[test]
    fn count_and_paging() {
        let req = parse(r#"read (count>=2 pagesize=10 countlimit=50 start=5)"#);
        let root = req.constraints.node(req.constraints.root());
        assert_eq!(root.count_min, 2);
        assert_eq!(root.pagesize, Some(10));
        assert_eq!(root.countlimit, Some(50));
        assert_eq!(root.start, 5);
    }

    #[test]
    fn timestamps_compile_to_bounds() {
        let req = parse(r#"read (timestamp>=2006-01-02 timestamp<2007-01-01)"#);
        let root = req.constraints.node(req.constraints.root());
        assert!(root.timestamp_min.is_some_and(|(_, incl)| incl));
        assert!(root.timestamp_max.is_some_and(|(_, incl)| !incl));
    }

    #[test]
    fn rejects_malformed() {
        for src in [
            "scan (name=\"a\")",
            "read (frobnicate=1)",
            "read (name=)",
            "read (guid=xyz)",
            "read (name=\"a\"",
            "read () trailing",
            "read ((<-sideways))",
        ] {
            let err = parse_request(src).unwrap_err();
            assert_eq!(err.code(), "SYNTAX", "{src}");
        }
    }
}
