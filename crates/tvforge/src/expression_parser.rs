//! Filter expression parser.
//!
//! Parses the boolean expression language used by filter definitions into a
//! [`ConditionTree`]. The grammar is deliberately small:
//!
//! ```text
//! expression := or_expr
//! or_expr    := and_expr ( OR and_expr )*
//! and_expr   := primary ( AND primary )*
//! primary    := '(' or_expr ')' | condition
//! condition  := field modifier* operator "value"
//! modifier   := 'not' | 'case_sensitive'
//! ```
//!
//! `AND` binds tighter than `OR`. Comparisons are case-insensitive unless the
//! `case_sensitive` modifier is present; `not` negates the operator. The
//! symbolic forms `&&`, `||`, `==` and `!=` are accepted and normalized during
//! tokenization. An empty or whitespace-only expression parses to `None`.

use crate::models::{ConditionNode, ConditionTree, FilterOperator, LogicalOperator};
use anyhow::{Result, anyhow, bail};

/// Parser configured with the canonical field list of its target domain.
#[derive(Debug, Clone, Default)]
pub struct ExpressionParser {
    valid_fields: Vec<String>,
}

/// Fields available to channel-target filter expressions.
pub fn channel_fields() -> Vec<String> {
    ["channel_name", "tvg_id", "tvg_name", "tvg_logo", "group_title", "stream_url"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Fields available to program-target filter expressions.
pub fn program_fields() -> Vec<String> {
    [
        "programme_title",
        "programme_description",
        "programme_category",
        "programme_start",
        "programme_stop",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Identifier(String),
    Value(String),
    And,
    Or,
    Not,
    CaseSensitive,
    LeftParen,
    RightParen,
}

impl ExpressionParser {
    pub fn new() -> Self {
        Self {
            valid_fields: Vec::new(),
        }
    }

    /// Restrict field references to the given canonical list.
    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.valid_fields = fields;
        self
    }

    /// Parse an expression. Returns `Ok(None)` for empty/whitespace input.
    pub fn parse(&self, expression: &str) -> Result<Option<ConditionTree>> {
        if expression.trim().is_empty() {
            return Ok(None);
        }

        let tokens = self.tokenize(expression)?;
        let mut pos = 0usize;
        let root = self.parse_or(&tokens, &mut pos)?;
        if pos != tokens.len() {
            bail!(
                "Unexpected trailing input at token {} in expression '{}'",
                pos,
                expression.trim()
            );
        }
        Ok(Some(ConditionTree { root }))
    }

    fn tokenize(&self, expression: &str) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        let chars: Vec<char> = expression.chars().collect();
        let mut i = 0usize;

        while i < chars.len() {
            let c = chars[i];
            match c {
                c if c.is_whitespace() => i += 1,
                '(' => {
                    tokens.push(Token::LeftParen);
                    i += 1;
                }
                ')' => {
                    tokens.push(Token::RightParen);
                    i += 1;
                }
                '"' | '\'' => {
                    let quote = c;
                    let mut value = String::new();
                    i += 1;
                    let mut closed = false;
                    while i < chars.len() {
                        let vc = chars[i];
                        if vc == '\\' && i + 1 < chars.len() {
                            value.push(chars[i + 1]);
                            i += 2;
                            continue;
                        }
                        if vc == quote {
                            closed = true;
                            i += 1;
                            break;
                        }
                        value.push(vc);
                        i += 1;
                    }
                    if !closed {
                        bail!("Unclosed {} quote in expression", quote);
                    }
                    tokens.push(Token::Value(value));
                }
                '&' if chars.get(i + 1) == Some(&'&') => {
                    tokens.push(Token::And);
                    i += 2;
                }
                '|' if chars.get(i + 1) == Some(&'|') => {
                    tokens.push(Token::Or);
                    i += 2;
                }
                '=' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Identifier("equals".to_string()));
                    i += 2;
                }
                '!' if chars.get(i + 1) == Some(&'=') => {
                    tokens.push(Token::Not);
                    tokens.push(Token::Identifier("equals".to_string()));
                    i += 2;
                }
                c if c.is_alphanumeric() || c == '_' => {
                    let mut word = String::new();
                    while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                        word.push(chars[i]);
                        i += 1;
                    }
                    match word.to_lowercase().as_str() {
                        "and" => tokens.push(Token::And),
                        "or" => tokens.push(Token::Or),
                        "not" => tokens.push(Token::Not),
                        "case_sensitive" => tokens.push(Token::CaseSensitive),
                        _ => tokens.push(Token::Identifier(word)),
                    }
                }
                other => bail!("Unexpected character '{}' in expression", other),
            }
        }

        Ok(tokens)
    }

    fn parse_or(&self, tokens: &[Token], pos: &mut usize) -> Result<ConditionNode> {
        let mut children = vec![self.parse_and(tokens, pos)?];
        while tokens.get(*pos) == Some(&Token::Or) {
            *pos += 1;
            children.push(self.parse_and(tokens, pos)?);
        }
        if children.len() == 1 {
            Ok(children.remove(0))
        } else {
            Ok(ConditionNode::Group {
                operator: LogicalOperator::Or,
                children,
            })
        }
    }

    fn parse_and(&self, tokens: &[Token], pos: &mut usize) -> Result<ConditionNode> {
        let mut children = vec![self.parse_primary(tokens, pos)?];
        while tokens.get(*pos) == Some(&Token::And) {
            *pos += 1;
            children.push(self.parse_primary(tokens, pos)?);
        }
        if children.len() == 1 {
            Ok(children.remove(0))
        } else {
            Ok(ConditionNode::Group {
                operator: LogicalOperator::And,
                children,
            })
        }
    }

    fn parse_primary(&self, tokens: &[Token], pos: &mut usize) -> Result<ConditionNode> {
        match tokens.get(*pos) {
            Some(Token::LeftParen) => {
                *pos += 1;
                let inner = self.parse_or(tokens, pos)?;
                match tokens.get(*pos) {
                    Some(Token::RightParen) => {
                        *pos += 1;
                        Ok(inner)
                    }
                    _ => bail!("Unclosed parenthesis in expression"),
                }
            }
            Some(Token::Identifier(_)) => self.parse_condition(tokens, pos),
            Some(other) => bail!("Expected field or '(' but found {:?}", other),
            None => bail!("Unexpected end of expression"),
        }
    }

    fn parse_condition(&self, tokens: &[Token], pos: &mut usize) -> Result<ConditionNode> {
        let field = match tokens.get(*pos) {
            Some(Token::Identifier(name)) => name.clone(),
            other => bail!("Expected field name, found {:?}", other),
        };
        *pos += 1;

        if !self.valid_fields.is_empty() && !self.valid_fields.iter().any(|f| f == &field) {
            let mut available = self.valid_fields.clone();
            available.sort();
            bail!(
                "Unknown field '{}'. Available fields: {}",
                field,
                available.join(", ")
            );
        }

        let mut negate = false;
        let mut case_sensitive = false;
        loop {
            match tokens.get(*pos) {
                Some(Token::Not) => {
                    negate = true;
                    *pos += 1;
                }
                Some(Token::CaseSensitive) => {
                    case_sensitive = true;
                    *pos += 1;
                }
                _ => break,
            }
        }

        let op_word = match tokens.get(*pos) {
            Some(Token::Identifier(word)) => word.to_lowercase(),
            other => bail!("Expected operator after field '{}', found {:?}", field, other),
        };
        *pos += 1;

        let mut operator = parse_operator(&op_word)
            .ok_or_else(|| anyhow!("Unknown operator '{}' for field '{}'", op_word, field))?;
        if negate {
            operator = operator
                .negated()
                .ok_or_else(|| anyhow!("Operator '{}' cannot be negated", op_word))?;
        }

        let value = match tokens.get(*pos) {
            Some(Token::Value(v)) => v.clone(),
            other => bail!(
                "Expected quoted value after '{} {}', found {:?}",
                field,
                op_word,
                other
            ),
        };
        *pos += 1;

        Ok(ConditionNode::Condition {
            field,
            operator,
            value,
            case_sensitive,
        })
    }
}

fn parse_operator(word: &str) -> Option<FilterOperator> {
    // Fused "not_*" forms are accepted for compatibility with stored filters.
    let op = match word {
        "equals" => FilterOperator::Equals,
        "contains" => FilterOperator::Contains,
        "starts_with" => FilterOperator::StartsWith,
        "ends_with" => FilterOperator::EndsWith,
        "matches" => FilterOperator::Matches,
        "not_equals" => FilterOperator::NotEquals,
        "not_contains" => FilterOperator::NotContains,
        "not_starts_with" => FilterOperator::NotStartsWith,
        "not_ends_with" => FilterOperator::NotEndsWith,
        "not_matches" => FilterOperator::NotMatches,
        "greater_than" => FilterOperator::GreaterThan,
        "less_than" => FilterOperator::LessThan,
        "greater_than_or_equal" => FilterOperator::GreaterThanOrEqual,
        "less_than_or_equal" => FilterOperator::LessThanOrEqual,
        _ => return None,
    };
    Some(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parser() -> ExpressionParser {
        ExpressionParser::new().with_fields(channel_fields())
    }

    fn condition(node: &ConditionNode) -> (&str, FilterOperator, &str, bool) {
        match node {
            ConditionNode::Condition {
                field,
                operator,
                value,
                case_sensitive,
            } => (field.as_str(), *operator, value.as_str(), *case_sensitive),
            other => panic!("expected condition, got {other:?}"),
        }
    }

    #[test]
    fn parses_simple_condition() {
        let tree = parser()
            .parse("channel_name contains \"Sports\"")
            .unwrap()
            .unwrap();
        let (field, op, value, cs) = condition(&tree.root);
        assert_eq!(field, "channel_name");
        assert_eq!(op, FilterOperator::Contains);
        assert_eq!(value, "Sports");
        assert!(!cs);
    }

    #[test]
    fn empty_expression_parses_to_none() {
        assert!(parser().parse("").unwrap().is_none());
        assert!(parser().parse("   \t ").unwrap().is_none());
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let tree = parser()
            .parse("group_title equals \"News\" OR group_title equals \"Sports\" AND channel_name contains \"HD\"")
            .unwrap()
            .unwrap();
        match tree.root {
            ConditionNode::Group { operator, children } => {
                assert_eq!(operator, LogicalOperator::Or);
                assert_eq!(children.len(), 2);
                assert!(matches!(
                    children[1],
                    ConditionNode::Group {
                        operator: LogicalOperator::And,
                        ..
                    }
                ));
            }
            other => panic!("expected OR group, got {other:?}"),
        }
    }

    #[test]
    fn parentheses_override_precedence() {
        let tree = parser()
            .parse("(group_title equals \"News\" OR group_title equals \"Sports\") AND channel_name contains \"HD\"")
            .unwrap()
            .unwrap();
        match tree.root {
            ConditionNode::Group { operator, children } => {
                assert_eq!(operator, LogicalOperator::And);
                assert!(matches!(
                    children[0],
                    ConditionNode::Group {
                        operator: LogicalOperator::Or,
                        ..
                    }
                ));
            }
            other => panic!("expected AND group, got {other:?}"),
        }
    }

    #[test]
    fn modifiers_apply_to_operator() {
        let tree = parser()
            .parse("channel_name not case_sensitive contains \"test\"")
            .unwrap()
            .unwrap();
        let (_, op, _, cs) = condition(&tree.root);
        assert_eq!(op, FilterOperator::NotContains);
        assert!(cs);
    }

    #[test]
    fn symbolic_operators_normalize() {
        let tree = parser()
            .parse("tvg_id == \"bbc.uk\" && channel_name != \"BBC Two\"")
            .unwrap()
            .unwrap();
        match tree.root {
            ConditionNode::Group { operator, children } => {
                assert_eq!(operator, LogicalOperator::And);
                assert_eq!(condition(&children[0]).1, FilterOperator::Equals);
                assert_eq!(condition(&children[1]).1, FilterOperator::NotEquals);
            }
            other => panic!("expected AND group, got {other:?}"),
        }
    }

    #[test]
    fn single_quoted_values_and_escapes() {
        let tree = parser().parse("channel_name equals 'It\\'s HD'").unwrap().unwrap();
        assert_eq!(condition(&tree.root).2, "It's HD");
    }

    #[test]
    fn rejects_unknown_field_with_listing() {
        let err = parser()
            .parse("channe_name contains \"typo\"")
            .unwrap_err()
            .to_string();
        assert!(err.contains("Unknown field 'channe_name'"));
        assert!(err.contains("channel_name"));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parser().parse("channel_name contains").is_err());
        assert!(parser().parse("channel_name containz \"x\"").is_err());
        assert!(parser().parse("channel_name contains \"unclosed").is_err());
        assert!(parser().parse("(channel_name contains \"x\"").is_err());
        assert!(parser().parse("channel_name contains \"x\" extra").is_err());
    }

    #[test]
    fn program_fields_accepted_for_epg_parser() {
        let epg = ExpressionParser::new().with_fields(program_fields());
        let tree = epg
            .parse("programme_title starts_with \"Late\" AND programme_category equals \"Talk\"")
            .unwrap()
            .unwrap();
        assert!(matches!(tree.root, ConditionNode::Group { .. }));
    }
}
