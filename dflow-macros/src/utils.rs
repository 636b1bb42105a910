use syn::{Attribute, Expr, ExprLit, Ident, Lit, Meta};

const ATTRIBUTE: &str = "type_key";

// Find `#[type_key = "..."]` or `#[type_key("...")]` among the attributes
pub(crate) fn find_type_key(attrs: &[Attribute]) -> syn::Result<Option<String>> {
    let mut found: Option<String> = None;
    for attr in attrs.iter().filter(|a| a.path().is_ident(ATTRIBUTE)) {
        if found.is_some() {
            return Err(syn::Error::new_spanned(attr, "duplicate #[type_key] attribute"));
        }
        found = Some(parse_key(attr)?);
    }
    Ok(found)
}

fn parse_key(attr: &Attribute) -> syn::Result<String> {
    match &attr.meta {
        Meta::NameValue(nv) => match &nv.value {
            Expr::Lit(ExprLit {
                lit: Lit::Str(s), ..
            }) => Ok(s.value()),
            other => Err(syn::Error::new_spanned(
                other,
                "expected a string literal: #[type_key = \"...\"]",
            )),
        },
        Meta::List(_) => {
            let lit: syn::LitStr = attr.parse_args()?;
            Ok(lit.value())
        }
        Meta::Path(path) => Err(syn::Error::new_spanned(
            path,
            "expected a value: #[type_key = \"...\"]",
        )),
    }
}

// Keys must be non-empty and free of whitespace so they read back unambiguously
pub(crate) fn validate_key(key: &str, ident: &Ident) -> syn::Result<()> {
    if key.is_empty() {
        return Err(syn::Error::new_spanned(ident, "type key must not be empty"));
    }
    if key.chars().any(char::is_whitespace) {
        return Err(syn::Error::new_spanned(
            ident,
            format!("type key '{}' must not contain whitespace", key),
        ));
    }
    Ok(())
}
