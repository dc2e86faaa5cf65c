//! Procedural macros for the docshard project.
//!
//! Provides `#[derive(Record)]`, which implements the record codec contract for
//! plain serde structs.

#[allow(unused_extern_crates)]
extern crate self as docshard_macros;

use proc_macro::TokenStream;
use quote::quote;
use syn::{
    Data, DeriveInput, Fields, LitStr, Token, parse_macro_input, meta::ParseNestedMeta,
    spanned::Spanned,
};

const ID_FIELD: &str = "_id";

/// Derive macro implementing `docshard::record::Record`.
///
/// The declared field list is taken from the serialized field names, honouring
/// `#[serde(rename = "...")]`, `#[serde(rename_all = "...")]`, `#[serde(alias = "...")]`
/// and `#[serde(skip)]`. A struct using `#[serde(flatten)]` is treated as a dynamic
/// shape and accepts any key.
///
/// The identifier is the field serialized as `_id`. Marking it `#[record(id)]` makes
/// the intent explicit and is checked.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize, Record)]
/// pub struct TopUser {
///     #[record(id)]
///     #[serde(rename = "_id")]
///     pub user_id: String,
///     pub place: i32,
/// }
/// ```
///
/// Generates:
/// - `FIELDS` with `["_id", "place"]`
/// - `id()` / `set_id()` reading and writing `user_id`
#[proc_macro_derive(Record, attributes(record))]
pub fn derive_record(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}

#[derive(Default)]
struct FieldAttrs {
    rename: Option<String>,
    aliases: Vec<String>,
    skip: bool,
    flatten: bool,
    id: bool,
}

fn expand(input: &DeriveInput) -> syn::Result<proc_macro2::TokenStream> {
    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new(
                    input.span(),
                    "Record can only be derived for structs with named fields",
                ));
            }
        },
        _ => return Err(syn::Error::new(input.span(), "Record can only be derived for structs")),
    };

    let rename_all = container_rename_all(input)?;

    let mut names = Vec::new();
    let mut dynamic = false;
    let mut id_field = None;

    for field in fields {
        let attrs = field_attrs(field)?;
        let ident = field
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new(field.span(), "expected a named field"))?;

        if attrs.flatten {
            dynamic = true;
        }
        if attrs.skip || attrs.flatten {
            if attrs.id {
                return Err(syn::Error::new(field.span(), "the identifier field cannot be skipped or flattened"));
            }
            continue;
        }

        let raw = ident.to_string();
        let raw = raw.trim_start_matches("r#");
        let serialized = match (&attrs.rename, &rename_all) {
            (Some(rename), _) => rename.clone(),
            (None, Some(rule)) => apply_rename_rule(rule, raw, field.span())?,
            (None, None) => raw.to_string(),
        };

        if attrs.id && serialized != ID_FIELD {
            return Err(syn::Error::new(
                field.span(),
                "the identifier field must serialize as `_id`, add #[serde(rename = \"_id\")]",
            ));
        }
        if serialized == ID_FIELD {
            if id_field.is_some() {
                return Err(syn::Error::new(field.span(), "more than one field serializes as `_id`"));
            }
            id_field = Some(ident);
        }

        names.push(serialized);
        names.extend(attrs.aliases);
    }

    let declared = if dynamic {
        quote! { ::core::option::Option::None }
    } else {
        quote! { ::core::option::Option::Some(&[#(#names),*]) }
    };

    let accessors = match id_field {
        Some(ident) => quote! {
            fn id(&self) -> ::core::option::Option<::docshard::bson::Bson> {
                ::docshard::record::id_to_bson(&self.#ident)
            }

            fn set_id(&mut self, id: ::docshard::bson::Bson) -> ::docshard::error::ShardocResult<()> {
                self.#ident = ::docshard::record::id_from_bson(id)?;
                ::core::result::Result::Ok(())
            }
        },
        None => {
            let message = format!("{} has no field serialized as `_id`", name);
            quote! {
                fn id(&self) -> ::core::option::Option<::docshard::bson::Bson> {
                    ::core::option::Option::None
                }

                fn set_id(&mut self, _id: ::docshard::bson::Bson) -> ::docshard::error::ShardocResult<()> {
                    ::core::result::Result::Err(::docshard::error::ShardocError::Configuration(#message.into()))
                }
            }
        }
    };

    Ok(quote! {
        impl #impl_generics ::docshard::record::Record for #name #ty_generics #where_clause {
            const FIELDS: ::core::option::Option<&'static [&'static str]> = #declared;

            #accessors
        }
    })
}

/// Consumes the value or nested list of a serde attribute item we do not interpret.
fn skip_item(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        meta.value()?.parse::<syn::Expr>()?;
    } else if meta.input.peek(syn::token::Paren) {
        meta.parse_nested_meta(|nested| skip_item(&nested))?;
    }

    Ok(())
}

/// Reads `name = "..."` or `name(deserialize = "...")`, keeping the deserialize side.
fn read_name(meta: &ParseNestedMeta) -> syn::Result<Option<String>> {
    if meta.input.peek(Token![=]) {
        return Ok(Some(meta.value()?.parse::<LitStr>()?.value()));
    }

    let mut name = None;
    meta.parse_nested_meta(|nested| {
        if nested.path.is_ident("deserialize") {
            name = Some(nested.value()?.parse::<LitStr>()?.value());
            Ok(())
        } else {
            skip_item(&nested)
        }
    })?;

    Ok(name)
}

fn container_rename_all(input: &DeriveInput) -> syn::Result<Option<String>> {
    let mut rule = None;

    for attr in input.attrs.iter().filter(|attr| attr.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") {
                rule = read_name(&meta)?;
                Ok(())
            } else {
                skip_item(&meta)
            }
        })?;
    }

    Ok(rule)
}

fn field_attrs(field: &syn::Field) -> syn::Result<FieldAttrs> {
    let mut attrs = FieldAttrs::default();

    for attr in &field.attrs {
        if attr.path().is_ident("record") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("id") {
                    attrs.id = true;
                    Ok(())
                } else {
                    Err(meta.error("unsupported record attribute, expected `id`"))
                }
            })?;
        } else if attr.path().is_ident("serde") {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("rename") {
                    attrs.rename = read_name(&meta)?;
                } else if meta.path.is_ident("alias") {
                    attrs.aliases.push(meta.value()?.parse::<LitStr>()?.value());
                } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_deserializing") {
                    attrs.skip = true;
                } else if meta.path.is_ident("flatten") {
                    attrs.flatten = true;
                } else {
                    skip_item(&meta)?;
                }
                Ok(())
            })?;
        }
    }

    Ok(attrs)
}

fn apply_rename_rule(rule: &str, field: &str, span: proc_macro2::Span) -> syn::Result<String> {
    let pascal = || {
        field
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<String>()
    };

    let renamed = match rule {
        "lowercase" | "snake_case" => field.to_ascii_lowercase(),
        "UPPERCASE" | "SCREAMING_SNAKE_CASE" => field.to_ascii_uppercase(),
        "PascalCase" => pascal(),
        "camelCase" => {
            let pascal = pascal();
            let mut chars = pascal.chars();
            match chars.next() {
                Some(first) => first.to_lowercase().chain(chars).collect(),
                None => String::new(),
            }
        }
        "kebab-case" => field.replace('_', "-"),
        "SCREAMING-KEBAB-CASE" => field.to_ascii_uppercase().replace('_', "-"),
        other => {
            return Err(syn::Error::new(span, format!("unknown rename rule `{}`", other)));
        }
    };

    Ok(renamed)
}
