//! Parsed dotted-path keys: `a.b.c`, list indexing `l[3]`, arithmetic
//! index expressions `l[a.b+c-1].d`, and back-references `a.b..c` == `a.c`.

use crate::{Dict, Error};

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// A named key, optionally followed by index expressions.
    Key { name: String, indexes: Vec<Expr> },
    /// An empty step (`..` or a leading `.`): back up one level.
    Parent,
}

/// An index expression: terms summed left-to-right. A term is either an
/// integer literal or a path resolved against the same dictionary.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr(pub Vec<(i64, Term)>);

#[derive(Debug, Clone, PartialEq)]
pub enum Term {
    Literal(i64),
    Path(Path),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Path(pub Vec<Step>);

impl Path {
    pub fn parse(path: &str) -> Result<Path, Error> {
        let mut steps = Vec::new();
        for raw in split_steps(path)? {
            if raw.is_empty() {
                steps.push(Step::Parent);
                continue;
            }
            let (name, indexes) = parse_step(path, &raw)?;
            steps.push(Step::Key { name, indexes });
        }
        Ok(Path(steps))
    }

    /// Collapse Parent steps, clamping back-tracking at the root, yielding
    /// only the Key steps actually traversed. Back-tracking does not
    /// validate the popped steps.
    pub fn canonical(self) -> Vec<Step> {
        let mut out: Vec<Step> = Vec::with_capacity(self.0.len());
        for step in self.0 {
            match step {
                Step::Parent => {
                    out.pop();
                }
                step => out.push(step),
            }
        }
        out
    }

    /// Evaluate all index expressions up front, against `dict`, so that
    /// mutating traversals need not re-borrow it.
    pub fn resolve_indexes(steps: &[Step], dict: &Dict) -> Result<Vec<Vec<usize>>, Error> {
        steps
            .iter()
            .map(|step| match step {
                Step::Key { indexes, .. } => {
                    indexes.iter().map(|x| x.eval(dict)).collect::<Result<Vec<_>, _>>()
                }
                Step::Parent => Ok(Vec::new()),
            })
            .collect()
    }
}

impl Expr {
    fn eval(&self, dict: &Dict) -> Result<usize, Error> {
        let mut total = 0i64;
        for (sign, term) in &self.0 {
            let v = match term {
                Term::Literal(n) => *n,
                Term::Path(p) => {
                    let path = p.display();
                    dict.get(&path)?.as_int().ok_or(Error::IndexNotInteger { path })?
                }
            };
            total += sign * v;
        }
        usize::try_from(total).map_err(|_| Error::IndexOutOfRange { index: total })
    }

    fn parse(path: &str, expr: &str) -> Result<Expr, Error> {
        let mut terms = Vec::new();
        let mut sign = 1i64;
        let mut tok = String::new();
        for ch in expr.chars().chain(std::iter::once('+')) {
            match ch {
                '+' | '-' => {
                    let t = tok.trim();
                    if t.is_empty() {
                        return Err(Error::Parse {
                            path: path.to_string(),
                            reason: "empty index term".to_string(),
                        });
                    }
                    let term = if t.bytes().all(|b| b.is_ascii_digit()) {
                        Term::Literal(t.parse().map_err(|_| Error::Parse {
                            path: path.to_string(),
                            reason: format!("bad index literal {:?}", t),
                        })?)
                    } else {
                        Term::Path(Path::parse(t)?)
                    };
                    terms.push((sign, term));
                    sign = if ch == '-' { -1 } else { 1 };
                    tok.clear();
                }
                ch => tok.push(ch),
            }
        }
        Ok(Expr(terms))
    }
}

impl Path {
    fn display(&self) -> String {
        let mut out = String::new();
        for (i, step) in self.0.iter().enumerate() {
            if i > 0 {
                out.push('.');
            }
            if let Step::Key { name, .. } = step {
                out.push_str(name);
            }
        }
        out
    }
}

/// Split a path on '.' at bracket depth zero. Consecutive dots produce
/// empty segments (back-references); so does a leading dot.
fn split_steps(path: &str) -> Result<Vec<String>, Error> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut depth = 0usize;
    for ch in path.chars() {
        match ch {
            '[' => {
                depth += 1;
                cur.push(ch);
            }
            ']' => {
                depth = depth.checked_sub(1).ok_or_else(|| Error::Parse {
                    path: path.to_string(),
                    reason: "unbalanced ']'".to_string(),
                })?;
                cur.push(ch);
            }
            '.' if depth == 0 => {
                out.push(std::mem::take(&mut cur));
            }
            ch => cur.push(ch),
        }
    }
    if depth != 0 {
        return Err(Error::Parse {
            path: path.to_string(),
            reason: "unbalanced '['".to_string(),
        });
    }
    out.push(cur);
    Ok(out)
}

fn parse_step(path: &str, raw: &str) -> Result<(String, Vec<Expr>), Error> {
    let Some(open) = raw.find('[') else {
        return Ok((raw.to_string(), Vec::new()));
    };
    let name = raw[..open].to_string();
    let mut indexes = Vec::new();
    let mut rest = &raw[open..];
    while !rest.is_empty() {
        if !rest.starts_with('[') {
            return Err(Error::Parse {
                path: path.to_string(),
                reason: format!("expected '[' at {:?}", rest),
            });
        }
        let close = rest.find(']').ok_or_else(|| Error::Parse {
            path: path.to_string(),
            reason: "unbalanced '['".to_string(),
        })?;
        indexes.push(Expr::parse(path, &rest[1..close])?);
        rest = &rest[close + 1..];
    }
    Ok((name, indexes))
}
