//! Path text parser.
//!
//! ```text
//! list := seq (',' seq)*
//! seq  := term ('.' seq)?
//! term := name ('<' name '>')? ('{' list '}')?
//! ```
//!
//! Whitespace between tokens is ignored.

/// One property term with its successors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PathNode {
    pub(crate) name: String,
    pub(crate) narrow: Option<String>,
    pub(crate) children: Vec<PathNode>,
}

pub(crate) fn parse(text: &str) -> Result<Vec<PathNode>, String> {
    let mut parser = Parser {
        chars: text.chars().collect(),
        position: 0,
    };
    let nodes = parser.list()?;
    parser.skip_whitespace();
    match parser.peek() {
        None => Ok(nodes),
        Some('}') => Err(format!("unmatched `}}` at {}", parser.position)),
        Some(other) => Err(format!("unexpected `{other}` at {}", parser.position)),
    }
}

struct Parser {
    chars: Vec<char>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.position).copied()
    }

    fn skip_whitespace(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.position += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_whitespace();
        if self.peek() == Some(expected) {
            self.position += 1;
            true
        } else {
            false
        }
    }

    fn list(&mut self) -> Result<Vec<PathNode>, String> {
        let mut nodes = vec![self.seq()?];
        while self.eat(',') {
            nodes.push(self.seq()?);
        }
        Ok(nodes)
    }

    fn seq(&mut self) -> Result<PathNode, String> {
        let mut node = self.term()?;
        if self.eat('.') {
            if !node.children.is_empty() {
                return Err(format!("`.` cannot follow the group of `{}`", node.name));
            }
            node.children.push(self.seq()?);
        }
        Ok(node)
    }

    fn term(&mut self) -> Result<PathNode, String> {
        let name = self.name()?;
        let narrow = if self.eat('<') {
            let narrow = self.name()?;
            if !self.eat('>') {
                return Err(format!("unmatched `<` after `{name}`"));
            }
            Some(narrow)
        } else {
            None
        };
        let children = if self.eat('{') {
            let children = self.list()?;
            if !self.eat('}') {
                return Err(format!("unmatched `{{` after `{name}`"));
            }
            children
        } else {
            Vec::new()
        };
        Ok(PathNode { name, narrow, children })
    }

    fn name(&mut self) -> Result<String, String> {
        self.skip_whitespace();
        let start = self.position;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_')
        {
            self.position += 1;
        }
        if start == self.position {
            return Err(match self.peek() {
                Some(c) => format!("expected a property name at {start}, found `{c}`"),
                None => "expected a property name at end of path".to_string(),
            });
        }
        Ok(self.chars[start..self.position].iter().collect())
    }
}
