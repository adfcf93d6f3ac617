//! Split an InfluxQL statement into tokens
//!
//! Only as much of the grammar is recognised as is needed to find keywords, names and simple
//! conditions: quoted strings, quoted identifiers and regular expressions are read as single
//! tokens so that their contents are never mistaken for keywords.

use nom::{
    IResult, Parser,
    branch::alt,
    bytes::complete::{is_not, tag},
    character::complete::{alpha1, alphanumeric1, anychar, char, digit1, multispace0},
    combinator::{map, recognize, value, verify},
    error::Error as NomError,
    multi::{fold_many0, many0_count},
    sequence::{delimited, pair, preceded},
};

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Token<'a> {
    /// An unquoted identifier or keyword
    Ident(&'a str),
    /// A double-quoted identifier, unescaped
    QuotedIdent(String),
    /// A single-quoted string literal, unescaped
    Str(String),
    /// A regular expression literal, without its delimiters
    Regex(String),
    /// A number, duration or other literal starting with a digit
    Number(&'a str),
    /// A multi-character operator
    Op(&'a str),
    Punct(char),
}

impl Token<'_> {
    /// `true` if this token is the unquoted keyword `keyword`
    pub(crate) fn is_keyword(&self, keyword: &str) -> bool {
        matches!(self, Self::Ident(s) if s.eq_ignore_ascii_case(keyword))
    }

    /// The name this token spells when used as an identifier
    pub(crate) fn name(&self) -> Option<&str> {
        match self {
            Self::Ident(s) => Some(s),
            Self::QuotedIdent(s) => Some(s),
            _ => None,
        }
    }

    /// The value this token spells when used as the right hand side of a condition
    pub(crate) fn literal(&self) -> Option<&str> {
        match self {
            Self::Ident(s) | Self::Number(s) => Some(s),
            Self::QuotedIdent(s) | Self::Str(s) => Some(s),
            _ => None,
        }
    }

    fn starts_regex(&self) -> bool {
        matches!(self, Self::Op("=~" | "!~")) || self.is_keyword("from")
    }
}

#[derive(Debug, Clone, Copy)]
enum Fragment<'a> {
    Literal(&'a str),
    Escaped(char),
}

fn delimited_string<'a>(delimiter: char) -> impl FnMut(&'a str) -> IResult<&'a str, String> {
    let literal = match delimiter {
        '"' => "\"\\\n",
        '/' => "/\\\n",
        _ => "'\\\n",
    };
    let fragment = alt((
        map(
            verify(is_not(literal), |s: &str| !s.is_empty()),
            Fragment::Literal,
        ),
        map(
            preceded(
                char('\\'),
                alt((value('\n', char('n')), value('\t', char('t')), anychar)),
            ),
            Fragment::Escaped,
        ),
    ));
    let build = fold_many0(fragment, String::new, move |mut s, fragment| {
        match fragment {
            Fragment::Literal(lit) => s.push_str(lit),
            // regular expressions keep their escapes, except for the delimiter itself
            Fragment::Escaped(c) if delimiter == '/' && c != '/' => {
                s.push('\\');
                s.push(c);
            }
            Fragment::Escaped(c) => s.push(c),
        }
        s
    });
    delimited(char(delimiter), build, char(delimiter))
}

fn unquoted_identifier(i: &str) -> IResult<&str, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0_count(alt((alphanumeric1, tag("_")))),
    ))(i)
}

fn number(i: &str) -> IResult<&str, &str> {
    recognize(pair(digit1, many0_count(alt((alphanumeric1, tag("."))))))(i)
}

fn operator(i: &str) -> IResult<&str, &str> {
    alt((
        tag("=~"),
        tag("!~"),
        tag("!="),
        tag("<>"),
        tag("<="),
        tag(">="),
        tag("::"),
    ))(i)
}

fn token(i: &str) -> IResult<&str, Token<'_>> {
    alt((
        map(unquoted_identifier, Token::Ident),
        map(number, Token::Number),
        map(operator, Token::Op),
        map(anychar, Token::Punct),
    ))
    .parse(i)
}

/// Split `input` into tokens
pub(crate) fn tokenize(input: &str) -> Result<Vec<Token<'_>>> {
    let offset = |rest: &str| input.len() - rest.len();
    let mut tokens: Vec<Token<'_>> = vec![];
    let mut rest = input;

    loop {
        let (remaining, _) = multispace0::<_, NomError<&str>>(rest)
            .map_err(|_| Error::Syntax { offset: offset(rest) })?;
        if remaining.is_empty() {
            return Ok(tokens);
        }

        let regex_allowed = tokens.last().is_some_and(Token::starts_regex);
        let parsed = match remaining.chars().next() {
            Some('/') if regex_allowed => map(delimited_string('/'), Token::Regex).parse(remaining),
            Some('"') => map(delimited_string('"'), Token::QuotedIdent).parse(remaining),
            Some('\'') => map(delimited_string('\''), Token::Str).parse(remaining),
            _ => token(remaining),
        };
        let (remaining, token) = parsed.map_err(|_| Error::Syntax {
            offset: offset(remaining),
        })?;

        tokens.push(token);
        rest = remaining;
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn tokens() {
        let got = tokenize(r#"SELECT "va\"l" FROM db..m WHERE t = 'it\'s' AND time >= 10ms"#).unwrap();
        assert_eq!(
            got,
            vec![
                Token::Ident("SELECT"),
                Token::QuotedIdent("va\"l".to_string()),
                Token::Ident("FROM"),
                Token::Ident("db"),
                Token::Punct('.'),
                Token::Punct('.'),
                Token::Ident("m"),
                Token::Ident("WHERE"),
                Token::Ident("t"),
                Token::Punct('='),
                Token::Str("it's".to_string()),
                Token::Ident("AND"),
                Token::Ident("time"),
                Token::Op(">="),
                Token::Number("10ms"),
            ]
        );
    }

    #[test]
    fn regex_after_match_operator() {
        let got = tokenize(r#"x =~ /^(a|b) \/c$/ AND y / 2"#).unwrap();
        assert_eq!(got[2], Token::Regex(r"^(a|b) /c$".to_string()));
        assert_eq!(got[5], Token::Punct('/'));
    }

    #[test]
    fn unterminated_string() {
        assert_matches!(
            tokenize("select * from m where t = 'abc"),
            Err(Error::Syntax { offset: 26 })
        );
    }
}
