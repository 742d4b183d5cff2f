use std::collections::HashMap;

/// Substitutes `{name}` placeholders from `vars`, leaving unknown
/// placeholders intact. `{{` and `}}` render as literal braces. Never fails
/// on missing keys, which makes it safe for user-supplied prompts.
pub fn safe_format(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut name = String::new();
                let mut closed = false;
                for inner in chars.by_ref() {
                    if inner == '}' {
                        closed = true;
                        break;
                    }
                    name.push(inner);
                }
                match (closed, vars.get(name.as_str())) {
                    (true, Some(value)) => out.push_str(value),
                    (true, None) => {
                        out.push('{');
                        out.push_str(&name);
                        out.push('}');
                    }
                    (false, _) => {
                        // unterminated placeholder, emit verbatim
                        out.push('{');
                        out.push_str(&name);
                    }
                }
            }
            _ => out.push(c),
        }
    }

    out
}
