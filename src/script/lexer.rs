//! Tokenizer for the sandbox language

use crate::error::{Error, Result};

/// A single token with its source position
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
  Ident(String),
  Num(f64),
  Str(String),
  // keywords
  Let,
  If,
  Else,
  Function,
  Return,
  True,
  False,
  Null,
  // punctuation
  LParen,
  RParen,
  LBrace,
  RBrace,
  LBracket,
  RBracket,
  Comma,
  Semi,
  Dot,
  Colon,
  // operators
  Assign,
  Eq,
  StrictEq,
  NotEq,
  StrictNotEq,
  Lt,
  Le,
  Gt,
  Ge,
  Plus,
  Minus,
  Star,
  Slash,
  Percent,
  Not,
  AndAnd,
  OrOr,
}

/// Tokenize the whole source, skipping whitespace and comments
pub fn tokenize(source: &str) -> Result<Vec<Token>> {
  let mut tokens = Vec::new();
  let chars: Vec<char> = source.chars().collect();
  let mut i = 0;

  while i < chars.len() {
    let c = chars[i];
    match c {
      ' ' | '\t' | '\r' | '\n' => i += 1,
      '/' if chars.get(i + 1) == Some(&'/') => {
        while i < chars.len() && chars[i] != '\n' {
          i += 1;
        }
      }
      '/' if chars.get(i + 1) == Some(&'*') => {
        i += 2;
        while i + 1 < chars.len() && !(chars[i] == '*' && chars[i + 1] == '/') {
          i += 1;
        }
        if i + 1 >= chars.len() {
          return Err(Error::script("unterminated block comment"));
        }
        i += 2;
      }
      '(' => {
        tokens.push(Token::LParen);
        i += 1;
      }
      ')' => {
        tokens.push(Token::RParen);
        i += 1;
      }
      '{' => {
        tokens.push(Token::LBrace);
        i += 1;
      }
      '}' => {
        tokens.push(Token::RBrace);
        i += 1;
      }
      '[' => {
        tokens.push(Token::LBracket);
        i += 1;
      }
      ']' => {
        tokens.push(Token::RBracket);
        i += 1;
      }
      ',' => {
        tokens.push(Token::Comma);
        i += 1;
      }
      ';' => {
        tokens.push(Token::Semi);
        i += 1;
      }
      '.' => {
        tokens.push(Token::Dot);
        i += 1;
      }
      ':' => {
        tokens.push(Token::Colon);
        i += 1;
      }
      '+' => {
        tokens.push(Token::Plus);
        i += 1;
      }
      '-' => {
        tokens.push(Token::Minus);
        i += 1;
      }
      '*' => {
        tokens.push(Token::Star);
        i += 1;
      }
      '/' => {
        tokens.push(Token::Slash);
        i += 1;
      }
      '%' => {
        tokens.push(Token::Percent);
        i += 1;
      }
      '=' => {
        if chars.get(i + 1) == Some(&'=') {
          if chars.get(i + 2) == Some(&'=') {
            tokens.push(Token::StrictEq);
            i += 3;
          } else {
            tokens.push(Token::Eq);
            i += 2;
          }
        } else {
          tokens.push(Token::Assign);
          i += 1;
        }
      }
      '!' => {
        if chars.get(i + 1) == Some(&'=') {
          if chars.get(i + 2) == Some(&'=') {
            tokens.push(Token::StrictNotEq);
            i += 3;
          } else {
            tokens.push(Token::NotEq);
            i += 2;
          }
        } else {
          tokens.push(Token::Not);
          i += 1;
        }
      }
      '<' => {
        if chars.get(i + 1) == Some(&'=') {
          tokens.push(Token::Le);
          i += 2;
        } else {
          tokens.push(Token::Lt);
          i += 1;
        }
      }
      '>' => {
        if chars.get(i + 1) == Some(&'=') {
          tokens.push(Token::Ge);
          i += 2;
        } else {
          tokens.push(Token::Gt);
          i += 1;
        }
      }
      '&' => {
        if chars.get(i + 1) == Some(&'&') {
          tokens.push(Token::AndAnd);
          i += 2;
        } else {
          return Err(Error::script("unexpected '&'"));
        }
      }
      '|' => {
        if chars.get(i + 1) == Some(&'|') {
          tokens.push(Token::OrOr);
          i += 2;
        } else {
          return Err(Error::script("unexpected '|'"));
        }
      }
      '"' | '\'' => {
        let quote = c;
        let mut text = String::new();
        i += 1;
        loop {
          match chars.get(i) {
            None => return Err(Error::script("unterminated string literal")),
            Some(&ch) if ch == quote => {
              i += 1;
              break;
            }
            Some('\\') => {
              let escaped = chars
                .get(i + 1)
                .ok_or_else(|| Error::script("unterminated escape"))?;
              text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                '\\' => '\\',
                '\'' => '\'',
                '"' => '"',
                other => *other,
              });
              i += 2;
            }
            Some(&ch) => {
              text.push(ch);
              i += 1;
            }
          }
        }
        tokens.push(Token::Str(text));
      }
      c if c.is_ascii_digit() => {
        let start = i;
        while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
          i += 1;
        }
        let text: String = chars[start..i].iter().collect();
        let value = text
          .parse::<f64>()
          .map_err(|_| Error::script(format!("invalid number: {}", text)))?;
        tokens.push(Token::Num(value));
      }
      c if c.is_ascii_alphabetic() || c == '_' || c == '$' => {
        let start = i;
        while i < chars.len()
          && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '$')
        {
          i += 1;
        }
        let word: String = chars[start..i].iter().collect();
        tokens.push(match word.as_str() {
          "let" | "var" | "const" => Token::Let,
          "if" => Token::If,
          "else" => Token::Else,
          "function" => Token::Function,
          "return" => Token::Return,
          "true" => Token::True,
          "false" => Token::False,
          "null" | "undefined" => Token::Null,
          _ => Token::Ident(word),
        });
      }
      other => return Err(Error::script(format!("unexpected character: {:?}", other))),
    }
  }

  Ok(tokens)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tokenizes_expression() {
    let tokens = tokenize(r#"ctx.request.method === "POST""#).unwrap();
    assert_eq!(
      tokens,
      vec![
        Token::Ident("ctx".into()),
        Token::Dot,
        Token::Ident("request".into()),
        Token::Dot,
        Token::Ident("method".into()),
        Token::StrictEq,
        Token::Str("POST".into()),
      ]
    );
  }

  #[test]
  fn skips_comments() {
    let tokens = tokenize("// line\n1 /* block */ + 2").unwrap();
    assert_eq!(tokens, vec![Token::Num(1.0), Token::Plus, Token::Num(2.0)]);
  }

  #[test]
  fn string_escapes() {
    let tokens = tokenize(r#"'a\'b\n'"#).unwrap();
    assert_eq!(tokens, vec![Token::Str("a'b\n".into())]);
  }

  #[test]
  fn rejects_unterminated_string() {
    assert!(tokenize("'abc").is_err());
  }
}
