use proc_macro::{Delimiter, Group, TokenStream, TokenTree};

/// Splits a `TokenStream` into comma-separated arguments.
///
/// Each argument is returned as a `Vec<TokenTree>`.
/// Commas at the top level are used as separators.
pub(crate) fn split_args(input: TokenStream) -> Vec<Vec<TokenTree>> {
    let mut args = Vec::new();
    let mut current = Vec::new();

    for token in input {
        match &token {
            TokenTree::Punct(p) if p.as_char() == ',' => {
                if !current.is_empty() {
                    args.push(current);
                    current = Vec::new();
                }
            }
            _ => current.push(token),
        }
    }

    if !current.is_empty() {
        args.push(current);
    }

    args
}

/// Converts a slice of tokens into a Rust source string.
///
/// Inserts spaces between consecutive identifiers to avoid accidental
/// token merging (e.g. `foo bar` vs `foobar`).
pub(crate) fn tokens_to_string(tokens: &[TokenTree]) -> String {
    let mut out = String::new();
    let mut prev_was_ident = false;

    for t in tokens {
        let needs_space = prev_was_ident && matches!(t, TokenTree::Ident(_));

        if needs_space {
            out.push(' ');
        }

        out.push_str(&t.to_string());
        prev_was_ident = matches!(t, TokenTree::Ident(_));
    }

    out
}

/// Options accepted by `#[iomgr::main]` and `#[iomgr::test]`.
pub(crate) struct Options {
    pub(crate) threads: Option<usize>,
    pub(crate) polling: bool,
}

/// Parses `threads = N, polling = true|false`.
pub(crate) fn parse_options(attr: TokenStream) -> Result<Options, String> {
    let mut opts = Options {
        threads: None,
        polling: false,
    };

    for arg in split_args(attr) {
        let arg = tokens_to_string(&arg);
        let Some((key, value)) = arg.split_once('=') else {
            return Err(format!("expected `key = value`, found `{arg}`"));
        };

        match key.trim() {
            "threads" => {
                let n = value
                    .trim()
                    .parse::<usize>()
                    .map_err(|_| format!("`threads` expects an integer, found `{}`", value.trim()))?;
                opts.threads = Some(n);
            }
            "polling" => {
                opts.polling = value
                    .trim()
                    .parse::<bool>()
                    .map_err(|_| format!("`polling` expects a bool, found `{}`", value.trim()))?;
            }
            other => return Err(format!("unknown option `{other}`")),
        }
    }

    Ok(opts)
}

/// Replaces the body of the annotated function with `wrap(body)`.
///
/// The body is the last brace-delimited group of the item.
pub(crate) fn rewrite_body(item: TokenStream, wrap: impl FnOnce(&str) -> String) -> TokenStream {
    let mut tokens: Vec<TokenTree> = item.into_iter().collect();

    let Some(pos) = tokens
        .iter()
        .rposition(|t| matches!(t, TokenTree::Group(g) if g.delimiter() == Delimiter::Brace))
    else {
        return compile_error("expected a function");
    };

    let block = match &tokens[pos] {
        TokenTree::Group(g) => g.stream().to_string(),
        _ => unreachable!(),
    };

    let body = match wrap(&block).parse::<TokenStream>() {
        Ok(body) => body,
        Err(err) => return compile_error(&err.to_string()),
    };

    tokens[pos] = TokenTree::Group(Group::new(Delimiter::Brace, body));
    tokens.into_iter().collect()
}

pub(crate) fn compile_error(msg: &str) -> TokenStream {
    format!("compile_error!({msg:?});")
        .parse()
        .unwrap_or_default()
}
