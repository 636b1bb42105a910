//! Procedural macros for durable flows.

mod utils;

use proc_macro::TokenStream;
use quote::quote;
use syn::{DeriveInput, parse_macro_input};

/// Derive `dflow_core::types::TypeKey`.
///
/// The key defaults to the type's name. Override it with
/// `#[type_key = "orders.Approve"]`. Keys are persisted, so renaming a type
/// without pinning its key breaks flows suspended under the old name.
///
/// ```rust,ignore
/// #[derive(TypeKey)]
/// #[type_key = "orders.Approve"]
/// struct ApproveOrder { order_id: u64 }
/// ```
#[proc_macro_derive(TypeKey, attributes(type_key))]
pub fn derive_type_key(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    expand_type_key(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

fn expand_type_key(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    if !input.generics.params.is_empty() {
        return Err(syn::Error::new_spanned(
            &input.generics,
            "TypeKey cannot be derived for generic types: every instantiation would share one key",
        ));
    }

    let key = utils::find_type_key(&input.attrs)?.unwrap_or_else(|| input.ident.to_string());
    utils::validate_key(&key, &input.ident)?;

    let ident = &input.ident;
    Ok(quote! {
        impl ::dflow_core::types::TypeKey for #ident {
            const TYPE_KEY: &'static str = #key;
        }
    })
}
