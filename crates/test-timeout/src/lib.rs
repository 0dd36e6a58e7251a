//! `#[test_timeout::timeout]`: run a synchronous test on its own thread and
//! fail it if it has not finished within the limit.
//!
//! ```ignore
//! #[test_timeout::timeout]        // 60 seconds
//! #[test_timeout::timeout(5)]     // 5 seconds
//! #[test_timeout::timeout(ms = 250)]
//! ```
//!
//! A timed-out test leaves its thread running; the harness process exits at
//! the end of the run anyway.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::{Attribute, Ident, ItemFn, LitInt, Token, parse_macro_input};

const DEFAULT_SECS: u64 = 60;

struct Limit {
    millis: u64,
}

impl Parse for Limit {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.is_empty() {
            return Ok(Self {
                millis: DEFAULT_SECS * 1000,
            });
        }
        let millis = if input.peek(Ident) {
            let unit: Ident = input.parse()?;
            input.parse::<Token![=]>()?;
            let value: LitInt = input.parse()?;
            match unit.to_string().as_str() {
                "ms" => value.base10_parse::<u64>()?,
                "secs" => value.base10_parse::<u64>()?.saturating_mul(1000),
                _ => return Err(syn::Error::new(unit.span(), "expected `ms = N` or `secs = N`")),
            }
        } else {
            let value: LitInt = input.parse()?;
            value.base10_parse::<u64>()?.saturating_mul(1000)
        };
        if millis == 0 {
            return Err(syn::Error::new(Span::call_site(), "timeout must be greater than zero"));
        }
        Ok(Self { millis })
    }
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let Limit { millis } = parse_macro_input!(attr as Limit);
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(&sig.ident, "timeout expects a synchronous test function")
            .to_compile_error()
            .into();
    }
    if !sig.inputs.is_empty() {
        return syn::Error::new_spanned(&sig.inputs, "test functions take no arguments")
            .to_compile_error()
            .into();
    }
    if !matches!(sig.output, syn::ReturnType::Default) {
        return syn::Error::new_spanned(&sig.output, "timeout tests must return ()")
            .to_compile_error()
            .into();
    }

    let attrs: Vec<Attribute> = attrs.into_iter().filter(|attr| !is_test_attribute(attr)).collect();
    let name = sig.ident.to_string();

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let limit = ::std::time::Duration::from_millis(#millis);
            let (done_tx, done_rx) = ::std::sync::mpsc::channel();
            ::std::thread::Builder::new()
                .name(::std::format!("test-{}", #name))
                .spawn(move || {
                    let outcome = ::std::panic::catch_unwind(::std::panic::AssertUnwindSafe(|| #block));
                    let _ = done_tx.send(outcome);
                })
                .expect("failed to spawn test thread");
            match done_rx.recv_timeout(limit) {
                Ok(Ok(())) => {}
                Ok(Err(payload)) => ::std::panic::resume_unwind(payload),
                Err(::std::sync::mpsc::RecvTimeoutError::Timeout) => {
                    panic!("{} timed out after {:?}", #name, limit)
                }
                Err(::std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("{} thread exited without reporting", #name)
                }
            }
        }
    })
}

fn is_test_attribute(attr: &Attribute) -> bool {
    attr.path().is_ident("test")
}
