//! Test attributes that put a hard wall-clock bound on async tests.
//!
//! `#[tokio_timeout_test]` runs the body on a fresh current-thread runtime in a
//! helper thread and fails the test if it has not finished in time. Arguments
//! may be given in any order:
//!
//! ```ignore
//! #[test_timeout::tokio_timeout_test]            // 60s
//! #[test_timeout::tokio_timeout_test(10)]        // 10s
//! #[test_timeout::tokio_timeout_test(5, paused)] // 5s, tokio clock starts paused
//! ```
//!
//! `paused` needs the `test-util` feature of tokio in the calling crate. With a
//! paused clock only the wall-clock bound is enforced.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::parse::{Parse, ParseStream};
use syn::punctuated::Punctuated;
use syn::{parse_macro_input, Attribute, Ident, ItemFn, LitInt, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

enum TimeoutArg {
    Secs(LitInt),
    Paused(Ident),
}

impl Parse for TimeoutArg {
    fn parse(input: ParseStream) -> syn::Result<Self> {
        if input.peek(LitInt) {
            return Ok(TimeoutArg::Secs(input.parse()?));
        }
        let ident: Ident = input.parse()?;
        if ident == "paused" {
            Ok(TimeoutArg::Paused(ident))
        } else {
            Err(syn::Error::new_spanned(
                ident,
                "expected a timeout in seconds or `paused`",
            ))
        }
    }
}

struct TimeoutOptions {
    secs: u64,
    paused: bool,
}

impl TimeoutOptions {
    fn from_args(args: Punctuated<TimeoutArg, Token![,]>) -> syn::Result<Self> {
        let mut options = TimeoutOptions {
            secs: DEFAULT_TIMEOUT_SECS,
            paused: false,
        };
        let mut seen_secs = false;
        for arg in args {
            match arg {
                TimeoutArg::Secs(lit) => {
                    if seen_secs {
                        return Err(syn::Error::new_spanned(lit, "timeout given twice"));
                    }
                    let secs: u64 = lit.base10_parse()?;
                    if secs == 0 {
                        return Err(syn::Error::new_spanned(
                            lit,
                            "timeout must be greater than zero",
                        ));
                    }
                    options.secs = secs;
                    seen_secs = true;
                }
                TimeoutArg::Paused(ident) => {
                    if options.paused {
                        return Err(syn::Error::new_spanned(ident, "`paused` given twice"));
                    }
                    options.paused = true;
                }
            }
        }
        Ok(options)
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = parse_macro_input!(attr with Punctuated::<TimeoutArg, Token![,]>::parse_terminated);
    let options = match TimeoutOptions::from_args(args) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    if !sig.inputs.is_empty() {
        return syn::Error::new_spanned(&sig.inputs, "test functions take no arguments")
            .to_compile_error()
            .into();
    }

    sig.asyncness = None;

    let filtered_attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_tokio_test_attribute(attr))
        .collect();

    let timeout = options.secs;
    let start_paused = syn::LitBool::new(options.paused, Span::call_site());

    // A paused clock may be advanced past any deadline, so only the
    // wall-clock bound applies there.
    let run_body = if options.paused {
        quote! { async move #block.await; }
    } else {
        quote! {
            tokio::time::timeout(timeout_duration, async move #block)
                .await
                .expect("test timed out");
        }
    };

    TokenStream::from(quote! {
        #[test]
        #(#filtered_attrs)*
        #vis #sig {
            let timeout_duration = std::time::Duration::from_secs(#timeout);
            let (sender, receiver) = std::sync::mpsc::channel();
            std::thread::spawn(move || {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    let runtime = tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .start_paused(#start_paused)
                        .build()
                        .expect("failed to build Tokio runtime");
                    runtime.block_on(async { #run_body });
                }));
                let _ = sender.send(result);
            });
            match receiver.recv_timeout(timeout_duration + std::time::Duration::from_secs(1)) {
                Ok(Ok(_)) => {}
                Ok(Err(payload)) => std::panic::resume_unwind(payload),
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                    panic!("test thread failed before reporting result")
                }
            }
        }
    })
}

fn is_tokio_test_attribute(attr: &Attribute) -> bool {
    let mut segments = attr.path().segments.iter();
    matches!(
        (segments.next(), segments.next(), segments.next()),
        (Some(first), Some(second), None)
            if first.ident == "tokio" && second.ident == "test"
    )
}
