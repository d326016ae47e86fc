//! Augment the development of dispatch primitives with procedural macros.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse_macro_input, AttributeArgs, Ident, ItemFn, Lit, Meta, NestedMeta};

/// Levels accepted by `#[test_traced(level = "...")]`.
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test with a [tracing] subscriber that writes to the test harness.
///
/// The subscriber only lives for the duration of the test, so logs from concurrently
/// running tests are not interleaved in the captured output of each.
///
/// # Arguments
///
/// - `level`: maximum level to record (defaults to `"DEBUG"`).
/// - `timeout`: seconds to wait for the test body before failing with `"timed out"`. When set,
///   the body runs on a dedicated thread (named after the test) so a hung rendezvous fails the
///   test instead of stalling the whole suite.
///
/// # Example
///
/// ```rust,ignore
/// use ringwork_macros::test_traced;
///
/// #[test_traced(level = "INFO", timeout = 10)]
/// fn test_drain() {
///     tracing::info!("draining");
/// }
/// ```
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr as AttributeArgs);
    let input = parse_macro_input!(item as ItemFn);

    // Parse arguments
    let mut level = String::from("DEBUG");
    let mut timeout: Option<u64> = None;
    for arg in args {
        match arg {
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("level") => match nv.lit {
                Lit::Str(lit) => {
                    let value = lit.value().to_uppercase();
                    if !LEVELS.contains(&value.as_str()) {
                        return syn::Error::new_spanned(
                            lit,
                            "level must be one of TRACE, DEBUG, INFO, WARN, or ERROR",
                        )
                        .to_compile_error()
                        .into();
                    }
                    level = value;
                }
                other => {
                    return syn::Error::new_spanned(other, "level must be a string literal")
                        .to_compile_error()
                        .into();
                }
            },
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("timeout") => {
                match nv.lit {
                    Lit::Int(lit) => match lit.base10_parse::<u64>() {
                        Ok(secs) => timeout = Some(secs),
                        Err(err) => return err.to_compile_error().into(),
                    },
                    other => {
                        return syn::Error::new_spanned(
                            other,
                            "timeout must be an integer number of seconds",
                        )
                        .to_compile_error()
                        .into();
                    }
                }
            }
            other => {
                return syn::Error::new_spanned(
                    other,
                    "expected `level = \"...\"` or `timeout = <seconds>`",
                )
                .to_compile_error()
                .into();
            }
        }
    }
    let level = Ident::new(&level, Span::call_site());

    // Rebuild the test
    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let name = &sig.ident;
    let body = match timeout {
        None => quote! {
            ::tracing::dispatcher::with_default(&dispatch, || #block);
        },
        Some(secs) => quote! {
            let (tx, rx) = ::std::sync::mpsc::channel::<()>();
            let handle = ::std::thread::Builder::new()
                .name(::std::string::String::from(stringify!(#name)))
                .spawn(move || {
                    ::tracing::dispatcher::with_default(&dispatch, || #block);
                    let _ = tx.send(());
                })
                .expect("failed to spawn test thread");
            match rx.recv_timeout(::std::time::Duration::from_secs(#secs)) {
                Ok(()) | Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    if let Err(err) = handle.join() {
                        ::std::panic::resume_unwind(err);
                    }
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test timed out after {} seconds", #secs);
                }
            }
        },
    };
    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            let dispatch = ::tracing::Dispatch::new(subscriber);
            #body
        }
    };
    TokenStream::from(expanded)
}
