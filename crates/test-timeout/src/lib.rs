//! Test attributes that fail a test when it runs past a deadline instead
//! of wedging the whole test binary on a stuck socket or channel.
//!
//! ```ignore
//! #[test_timeout::timeout]          // sync test, 60s
//! #[test_timeout::timeout(5)]       // sync test, 5s
//! #[test_timeout::tokio_timeout_test]      // async test, current-thread runtime
//! #[test_timeout::tokio_timeout_test(10)]  // async test, 10s
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Body {
    Sync,
    Async,
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, parse_macro_input!(item as ItemFn), Body::Sync)
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    expand(attr, parse_macro_input!(item as ItemFn), Body::Async)
}

fn expand(attr: TokenStream, function: ItemFn, body: Body) -> TokenStream {
    let secs = match parse_timeout(attr) {
        Ok(secs) => secs,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = function;

    match (body, sig.asyncness.is_some()) {
        (Body::Async, false) => {
            return spanned_error(&sig.ident, "tokio_timeout_test expects an async fn");
        }
        (Body::Sync, true) => {
            return spanned_error(
                &sig.ident,
                "timeout expects a synchronous fn; use tokio_timeout_test for async tests",
            );
        }
        _ => {}
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_test_marker(attr))
        .collect();

    let run: TokenStream2 = match body {
        Body::Sync => quote! { #block },
        Body::Async => quote! {{
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build Tokio runtime");
            runtime.block_on(async move {
                tokio::time::timeout(__deadline, async move #block)
                    .await
                    .expect("test timed out");
            });
        }},
    };

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let __deadline = std::time::Duration::from_secs(#secs);
            let (__done_tx, __done_rx) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| #run));
                let _ = __done_tx.send(outcome);
            });
            match __done_rx.recv_timeout(__deadline) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("test exceeded {}s deadline", #secs)
                }
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread exited without reporting a result")
                }
            }
        }
    })
}

fn parse_timeout(attr: TokenStream) -> syn::Result<u64> {
    if attr.is_empty() {
        return Ok(DEFAULT_TIMEOUT_SECS);
    }
    let literal: LitInt = syn::parse(attr)?;
    let secs: u64 = literal.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new(
            literal.span(),
            "timeout must be greater than zero",
        ));
    }
    Ok(secs)
}

fn spanned_error(ident: &syn::Ident, message: &str) -> TokenStream {
    syn::Error::new_spanned(ident, message)
        .to_compile_error()
        .into()
}

// Drops `#[test]` and `#[tokio::test]` so the generated `#[test]` is the only one.
fn is_test_marker(attr: &Attribute) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    matches!(
        segments.iter().map(String::as_str).collect::<Vec<_>>().as_slice(),
        ["test"] | ["tokio", "test"]
    )
}
