//! The hand-written tokenizer.
//!
//! Reads the complete source up front and hands out tokens on demand. Three
//! tokens are always materialised (current, lookahead, lookahead2), which is
//! exactly the window the single-pass compiler needs to disambiguate
//! definitions, calls and assignments.
//!
//! Whitespace is skipped. `//` line comments are skipped as well unless the
//! tokenizer is built with `keep_comments` — syntax highlighters want them,
//! the compiler does not.

use super::token::{InputToken, TokenType};

pub struct Tokenizer {
    chars: Vec<char>,
    /// Index of the character currently under the cursor.
    index: usize,
    line: u32,
    column: u32,
    keep_comments: bool,
    current: InputToken,
    lookahead: InputToken,
    lookahead2: InputToken,
}

impl Tokenizer {
    pub fn new(source: &str, keep_comments: bool) -> Self {
        let mut tokenizer = Tokenizer {
            chars: source.chars().collect(),
            index: 0,
            line: 1,
            column: 1,
            keep_comments,
            current: InputToken::empty(),
            lookahead: InputToken::empty(),
            lookahead2: InputToken::empty(),
        };
        tokenizer.skip_whitespace();
        tokenizer
    }

    fn more(&self) -> bool {
        self.index < self.chars.len()
    }

    fn ch(&self) -> char {
        if self.index < self.chars.len() {
            self.chars[self.index]
        } else {
            '\0'
        }
    }

    fn preview(&self) -> Option<char> {
        self.chars.get(self.index + 1).copied()
    }

    fn preview2(&self) -> Option<char> {
        self.chars.get(self.index + 2).copied()
    }

    fn next_char(&mut self) {
        if self.index < self.chars.len() {
            if self.chars[self.index] == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
            self.index += 1;
        }
    }

    fn skip_whitespace(&mut self) {
        while self.more() && self.ch().is_whitespace() {
            self.next_char();
        }
    }

    /// Starts a token at the cursor position; `fetch_token` fills in type
    /// and length.
    fn begin_token(&self, token_type: TokenType) -> InputToken {
        InputToken {
            token_type,
            line: self.line,
            column: self.column,
            absolute_offset: self.index,
            length: 0,
        }
    }

    fn fetch_token(&mut self) -> InputToken {
        self.skip_whitespace();
        if !self.more() {
            return self.begin_token(TokenType::Eof);
        }

        let ch = self.ch();
        if ch.is_alphabetic() {
            self.parse_name()
        } else if ch == '#' && self.preview().is_some_and(|c| c.is_alphabetic()) {
            self.parse_symbol()
        } else if ch.is_ascii_digit() || (ch == '-' && self.preview().is_some_and(|c| c.is_ascii_digit())) {
            self.parse_number()
        } else if ch == '\'' {
            self.parse_string()
        } else if ch == '/' && self.preview() == Some('/') {
            let comment = self.parse_comment();
            if self.keep_comments {
                comment
            } else {
                self.fetch_token()
            }
        } else {
            self.parse_operator()
        }
    }

    fn parse_name(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Name);
        token.length = 1;
        self.next_char();
        while self.more() && (self.ch().is_alphanumeric() || self.ch() == ':' || self.ch() == '_') {
            token.length += 1;
            self.next_char();
        }
        token
    }

    fn parse_symbol(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Symbol);
        token.length = 1;
        self.next_char();
        while self.more() && (self.ch().is_alphanumeric() || self.ch() == '_') {
            token.length += 1;
            self.next_char();
        }
        token
    }

    fn parse_number(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Number);
        let mut separator_seen = false;
        token.length = 1;
        self.next_char();
        while self.more() && (self.ch().is_ascii_digit() || (!separator_seen && self.ch() == '.')) {
            if self.ch() == '.' {
                separator_seen = true;
                token.token_type = TokenType::Decimal;
            }
            token.length += 1;
            self.next_char();
        }
        token
    }

    fn parse_string(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Str);
        token.length = 1;
        self.next_char();
        while self.more() && self.ch() != '\'' {
            if self.ch() == '\\' {
                token.length += 1;
                self.next_char();
                if !self.more() {
                    break;
                }
            }
            token.length += 1;
            self.next_char();
        }
        if self.more() {
            token.length += 1;
            self.next_char();
        }
        token
    }

    fn parse_comment(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Comment);
        while self.more() && self.ch() != '\n' {
            token.length += 1;
            self.next_char();
        }
        token
    }

    fn parse_operator(&mut self) -> InputToken {
        let mut token = self.begin_token(TokenType::Unknown);
        token.length = 1;
        let ch = self.ch();
        match ch {
            '(' => token.token_type = TokenType::LParen,
            ')' => token.token_type = TokenType::RParen,
            '{' => token.token_type = TokenType::LCurly,
            '}' => token.token_type = TokenType::RCurly,
            '[' => token.token_type = TokenType::LBracket,
            ']' => token.token_type = TokenType::RBracket,
            ';' => token.token_type = TokenType::Semicolon,
            ',' => token.token_type = TokenType::Comma,
            '.' => token.token_type = TokenType::Dot,
            '=' => token.token_type = TokenType::Eq,
            '+' => token.token_type = TokenType::Plus,
            '%' => token.token_type = TokenType::Mod,
            '*' => token.token_type = TokenType::Mul,
            '^' => token.token_type = TokenType::Caret,
            '/' => token.token_type = TokenType::Div,
            '&' => {
                if self.preview() == Some('&') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::And;
                } else {
                    token.token_type = TokenType::Concat;
                }
            }
            '|' => {
                if self.preview() == Some('|') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::Or;
                } else {
                    token.token_type = TokenType::Split;
                }
            }
            ':' => {
                if self.preview() == Some('=') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::Assignment;
                } else if self.preview() == Some(':') {
                    if self.preview2() == Some('=') {
                        self.next_char();
                        self.next_char();
                        token.length = 3;
                        token.token_type = TokenType::GlobalAssignment;
                    }
                } else {
                    token.token_type = TokenType::Colon;
                }
            }
            '#' => {
                if self.preview() == Some('(') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::ListStart;
                }
            }
            '-' => {
                if self.preview() == Some('>') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::Arrow;
                } else {
                    token.token_type = TokenType::Minus;
                }
            }
            '!' => {
                if self.preview() == Some('=') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::Ne;
                } else {
                    token.token_type = TokenType::Not;
                }
            }
            '<' => {
                if self.preview() == Some('=') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::LtEq;
                } else {
                    token.token_type = TokenType::Lt;
                }
            }
            '>' => {
                if self.preview() == Some('=') {
                    self.next_char();
                    token.length = 2;
                    token.token_type = TokenType::GtEq;
                } else {
                    token.token_type = TokenType::Gt;
                }
            }
            _ => {}
        }
        self.next_char();
        token
    }

    /// Advances the token window and returns the new current token.
    pub fn fetch(&mut self) -> InputToken {
        if self.current.token_type == TokenType::Empty {
            self.current = self.fetch_token();
            self.lookahead = self.fetch_token();
            self.lookahead2 = self.fetch_token();
        } else {
            self.current = self.lookahead;
            self.lookahead = self.lookahead2;
            self.lookahead2 = self.fetch_token();
        }
        self.current
    }

    fn prime(&mut self) {
        if self.current.token_type == TokenType::Empty {
            self.fetch();
        }
    }

    pub fn current(&mut self) -> InputToken {
        self.prime();
        self.current
    }

    pub fn lookahead(&mut self) -> InputToken {
        self.prime();
        self.lookahead
    }

    pub fn lookahead2(&mut self) -> InputToken {
        self.prime();
        self.lookahead2
    }

    pub fn is_current(&mut self, token_type: TokenType) -> bool {
        self.current().token_type == token_type
    }

    pub fn is_lookahead(&mut self, token_type: TokenType) -> bool {
        self.lookahead().token_type == token_type
    }

    pub fn is_lookahead2(&mut self, token_type: TokenType) -> bool {
        self.lookahead2().token_type == token_type
    }

    /// The raw source text covered by `token`.
    pub fn text(&self, token: &InputToken) -> String {
        self.chars[token.absolute_offset..token.absolute_offset + token.length]
            .iter()
            .collect()
    }

    /// The current token's text, with placeholders for the stream edges.
    pub fn current_text(&mut self) -> String {
        self.prime();
        match self.current.token_type {
            TokenType::Eof => "(end of input)".to_string(),
            TokenType::Empty => "(no input)".to_string(),
            _ => {
                let token = self.current;
                self.text(&token)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenType> {
        let mut tokenizer = Tokenizer::new(source, false);
        let mut result = Vec::new();
        loop {
            let token = tokenizer.fetch();
            if token.token_type == TokenType::Eof {
                break;
            }
            result.push(token.token_type);
        }
        result
    }

    #[test]
    fn names_symbols_and_literals() {
        use TokenType::*;
        assert_eq!(
            kinds("foo #bar 'baz' 42 3.14"),
            vec![Name, Symbol, Str, Number, Decimal]
        );
    }

    #[test]
    fn operator_disambiguation() {
        use TokenType::*;
        assert_eq!(kinds("&& & || |"), vec![And, Concat, Or, Split]);
        assert_eq!(kinds(":= ::= :"), vec![Assignment, GlobalAssignment, Colon]);
        assert_eq!(kinds("-> - != ! <= < >= >"), vec![Arrow, Minus, Ne, Not, LtEq, Lt, GtEq, Gt]);
        assert_eq!(kinds("#( # ("), vec![ListStart, Unknown, LParen]);
    }

    #[test]
    fn minus_glues_to_a_following_digit() {
        use TokenType::*;
        assert_eq!(kinds("1 - 2"), vec![Number, Minus, Number]);
        // Without the space the minus is taken as a sign; the compiler
        // rewrites the negative literal into an addition.
        assert_eq!(kinds("1 -2"), vec![Number, Number]);
    }

    #[test]
    fn number_with_a_single_dot_is_a_decimal() {
        use TokenType::*;
        assert_eq!(kinds("1.5"), vec![Decimal]);
        assert_eq!(kinds("1.5.7"), vec![Decimal, Dot, Number]);
    }

    #[test]
    fn keyword_names_keep_their_colons() {
        let mut tokenizer = Tokenizer::new("from: 1 to: 10", false);
        let first = tokenizer.fetch();
        assert_eq!(first.token_type, TokenType::Name);
        assert_eq!(tokenizer.text(&first), "from:");
    }

    #[test]
    fn strings_support_escapes() {
        let mut tokenizer = Tokenizer::new(r"'it\'s'", false);
        let token = tokenizer.fetch();
        assert_eq!(token.token_type, TokenType::Str);
        assert_eq!(tokenizer.text(&token), r"'it\'s'");
    }

    #[test]
    fn comments_are_skipped_by_default() {
        use TokenType::*;
        assert_eq!(kinds("1 // ignored\n2"), vec![Number, Number]);
    }

    #[test]
    fn comments_can_be_kept_for_highlighting() {
        let mut tokenizer = Tokenizer::new("1 // note\n2", true);
        let token_types: Vec<TokenType> = std::iter::from_fn(|| {
            let token = tokenizer.fetch();
            (token.token_type != TokenType::Eof).then_some(token.token_type)
        })
        .collect();
        assert_eq!(
            token_types,
            vec![TokenType::Number, TokenType::Comment, TokenType::Number]
        );
    }

    #[test]
    fn positions_track_lines_and_columns() {
        let mut tokenizer = Tokenizer::new("a\n  bb", false);
        let a = tokenizer.fetch();
        assert_eq!((a.line, a.column), (1, 1));
        let bb = tokenizer.fetch();
        assert_eq!((bb.line, bb.column), (2, 3));
        assert_eq!(bb.length, 2);
    }

    #[test]
    fn lookahead_window_is_stable() {
        let mut tokenizer = Tokenizer::new("a b c d", false);
        assert_eq!(tokenizer.current_text(), "a");
        assert!(tokenizer.is_lookahead(TokenType::Name));
        let b = tokenizer.lookahead();
        assert_eq!(tokenizer.text(&b), "b");
        let c = tokenizer.lookahead2();
        assert_eq!(tokenizer.text(&c), "c");
        tokenizer.fetch();
        assert_eq!(tokenizer.current_text(), "b");
    }
}
