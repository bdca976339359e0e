// These lints are triggered by darling's generated code for
// `#[darling(default)]`.
#![allow(clippy::option_if_let_else)]
#![allow(clippy::needless_continue)]

use darling::FromDeriveInput;
use heck::ToKebabCase;
use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{DeriveInput, Ident, parse_macro_input};

/// Configuration for the `#[event(...)]` attribute.
#[derive(Debug, FromDeriveInput)]
#[darling(attributes(event), supports(struct_any, enum_any))]
struct EventArgs {
    ident: Ident,
    generics: syn::Generics,
    aggregate: String,
    #[darling(default)]
    kind: Option<String>,
}

/// Returns the kind override or the default kebab-case name from the ident.
fn default_kind(ident: &Ident, kind: Option<String>) -> String {
    kind.unwrap_or_else(|| ident.to_string().to_kebab_case())
}

/// Parse derive input with darling and render errors as tokens.
fn parse_or_error<T, F>(input: &DeriveInput, f: F) -> TokenStream2
where
    T: FromDeriveInput,
    F: FnOnce(T) -> TokenStream2,
{
    match T::from_derive_input(input) {
        Ok(args) => f(args),
        Err(err) => err.write_errors(),
    }
}

/// Derives the `DomainEvent` trait for a serde-serializable type.
///
/// # Attributes
///
/// ## Required
/// - `aggregate = "name"` - aggregate type that emits the event
///
/// ## Optional
/// - `kind = "name"` - stored discriminator (default: kebab-case type name)
///
/// # Example
///
/// ```ignore
/// #[derive(Serialize, Deserialize, DomainEvent)]
/// #[event(aggregate = "account")]
/// pub struct FundsDeposited {
///     amount: i64,
/// }
///
/// assert_eq!(FundsDeposited::KIND, "funds-deposited");
/// ```
#[proc_macro_derive(DomainEvent, attributes(event))]
pub fn derive_domain_event(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    derive_domain_event_impl(&input).into()
}

fn derive_domain_event_impl(input: &DeriveInput) -> TokenStream2 {
    parse_or_error::<EventArgs, _>(input, generate_domain_event_impl)
}

fn generate_domain_event_impl(args: EventArgs) -> TokenStream2 {
    if args.aggregate.is_empty() {
        return darling::Error::custom("aggregate must not be empty")
            .with_span(&args.ident)
            .write_errors();
    }
    let ident = &args.ident;
    let kind = default_kind(ident, args.kind.clone());
    let aggregate = &args.aggregate;
    let (impl_generics, ty_generics, where_clause) = args.generics.split_for_impl();

    quote! {
        impl #impl_generics ::tempora::DomainEvent for #ident #ty_generics #where_clause {
            const KIND: &'static str = #kind;
            const AGGREGATE_TYPE: &'static str = #aggregate;
        }
    }
}
