//! Attribute macros for the `iomgr` crate.
//!
//! Both macros build an `IoManager`, start it with the requested reactors,
//! bind it to `runtime` for the function body and stop it when the body
//! returns or unwinds.

mod utils;

use proc_macro::TokenStream;

/// Runs `main` inside a started `IoManager`.
///
/// ```rust,ignore
/// #[iomgr::main(threads = 4, polling = false)]
/// fn main() {
///     runtime.run_on(iomgr::ThreadRegex::AllWorker, || {}, true);
/// }
/// ```
///
/// `threads` defaults to the available parallelism.
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let opts = match utils::parse_options(attr) {
        Ok(opts) => opts,
        Err(msg) => return utils::compile_error(&msg),
    };

    let threads = match opts.threads {
        Some(n) => n.to_string(),
        None => String::from(
            "::std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)",
        ),
    };

    utils::rewrite_body(item, |block| wrap_block(&threads, opts.polling, block))
}

/// Turns the function into a `#[test]` running inside a started
/// `IoManager` (one reactor unless `threads` says otherwise).
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let opts = match utils::parse_options(attr) {
        Ok(opts) => opts,
        Err(msg) => return utils::compile_error(&msg),
    };

    let threads = opts.threads.unwrap_or(1).to_string();
    let body = utils::rewrite_body(item, |block| wrap_block(&threads, opts.polling, block));

    let mut result: TokenStream = "#[test]".parse().unwrap_or_default();
    result.extend(body);
    result
}

fn wrap_block(threads: &str, polling: bool, block: &str) -> String {
    format!(
        "{{
            let runtime = ::iomgr::IoManagerBuilder::new().build();
            runtime
                .start(::iomgr::StartOptions::new({threads}).polling_backend({polling}))
                .expect(\"failed to start io manager\");

            struct __IomgrStop(::std::sync::Arc<::iomgr::IoManager>);

            impl ::std::ops::Drop for __IomgrStop {{
                fn drop(&mut self) {{
                    let _ = self.0.stop();
                }}
            }}

            let __iomgr_stop = __IomgrStop(::std::sync::Arc::clone(&runtime));
            {block}
        }}"
    )
}
