use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, spanned::Spanned, FnArg, Ident, ItemFn, Pat, Signature, Type};

/// Transform an asynchronous test into a synchronous one and inject dependencies.
///
/// Every test gets a fresh in-memory store and a server built on top of it.
/// Injectable dependencies are [`rocket::local::asynchronous::Client`],
/// [`crate::model::store::Storage`], and [`crate::Bearer`]. The last requires
/// a role argument (`admin`, `voter`, `blind_voter` or `disabled_voter`):
/// an account with that role is registered and signed in before the test runs.
#[proc_macro_attribute]
pub fn backend_test(args: TokenStream, input: TokenStream) -> TokenStream {
    let mut item_fn = parse_macro_input!(input as ItemFn);
    let role = parse_macro_input!(args as Option<Ident>);

    // Extract type information and reject invalid function signatures.
    let (test_args, wants_bearer) = match check_sig(item_fn.sig.clone()) {
        Ok(args) => args,
        Err(err) => {
            return err.into_compile_error().into();
        }
    };

    // Sign in as the requested role, if any.
    let maybe_login = match role {
        Some(role) => {
            let variant = match role.to_string().as_str() {
                "admin" => quote! { Admin },
                "voter" => quote! { Voter },
                "blind_voter" => quote! { BlindVoter },
                "disabled_voter" => quote! { DisabledVoter },
                _ => {
                    return syn::Error::new(
                        role.span(),
                        "Expected one of `admin`, `voter`, `blind_voter` or `disabled_voter`",
                    )
                    .into_compile_error()
                    .into();
                }
            };
            quote! {
                let bearer = crate::testing::login(
                    &rocket_client,
                    &storage,
                    crate::testing::Role::#variant,
                )
                .await;
            }
        }
        None if wants_bearer => {
            return syn::Error::new(
                item_fn.sig.span(),
                "Injecting `Bearer` needs a role, e.g. `#[backend_test(voter)]`",
            )
            .into_compile_error()
            .into();
        }
        None => quote! { let bearer = (); },
    };

    // Rename the future so the test can have its original name.
    let name = item_fn.sig.ident.clone();
    let new_name = format_ident!("{}_fut", name);
    item_fn.sig.ident = new_name.clone();

    // Rewrite the test function.
    quote! {
        #[test]
        fn #name() {
            log4rs_test_utils::test_logging::init_logging_once_for(
                ["accessvote_backend"],
                None,
                None,
            );

            /// The test itself.
            #item_fn

            let runtime = rocket::tokio::runtime::Builder::new_multi_thread()
                .thread_name("rocket-worker-test-thread")
                .worker_threads(2)
                .enable_all()
                .build()
                .unwrap();

            runtime.block_on(async {
                // Test setup.
                let storage = crate::model::store::Storage::memory();
                let rocket_client = rocket::local::asynchronous::Client::tracked(
                    crate::rocket_for_store(crate::test_figment(), storage.clone()),
                )
                .await
                .unwrap();
                #maybe_login
                let _ = (&rocket_client, &bearer);
                #new_name(#(#test_args),*).await;
            });
        }
    }
    .into()
}

/// Ensure the wrapped test is async, extract parameters to inject, and reject unknown parameters.
fn check_sig(sig: Signature) -> Result<(Vec<TokenStream2>, bool), syn::Error> {
    if sig.asyncness.is_none() {
        return Err(syn::Error::new(sig.span(), "Test must be marked `async`"));
    }

    let mut args = vec![];
    let mut seen: Vec<String> = vec![];

    for input in &sig.inputs {
        if let FnArg::Typed(pat_type) = input {
            if let Pat::Ident(_) = &*pat_type.pat {
                if let Type::Path(type_path) = &*pat_type.ty {
                    if let Some(segment) = type_path.path.segments.last() {
                        let type_name = segment.ident.to_string();
                        let injected = match type_name.as_str() {
                            "Client" => Some(quote! { rocket_client }),
                            "Storage" => Some(quote! { storage.clone() }),
                            "Bearer" => Some(quote! { bearer.clone() }),
                            _ => None,
                        };
                        if let Some(injected) = injected {
                            if seen.contains(&type_name) {
                                return Err(syn::Error::new(
                                    input.span(),
                                    format!("Test cannot accept more than one `{type_name}`"),
                                ));
                            }
                            seen.push(type_name);
                            args.push(injected);
                            continue;
                        }
                    }
                }
            }
        }

        return Err(syn::Error::new(
            input.span(),
            "Expected one of `client: Client`, `storage: Storage` or `bearer: Bearer`",
        ));
    }

    let wants_bearer = seen.iter().any(|name| name == "Bearer");
    Ok((args, wants_bearer))
}
