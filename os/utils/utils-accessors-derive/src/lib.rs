//! # Accessor Derive
//!
//! `#[derive(Accessors)]` generates, for every named field of a struct:
//!
//! * `const fn with_<field>(self, value) -> Self` for builder-style construction,
//! * `fn set_<field>(&mut self, value) -> &mut Self` for in-place updates,
//! * `const fn <field>(&self) -> Ty`, a by-value getter (the field type must be `Copy`).
//!
//! Field options:
//!
//! * `#[accessors(skip)]` generates nothing for the field.
//! * `#[accessors(no_get)]` omits the getter, e.g. for non-`Copy` fields.
//!
//! The `with_` builders are `const`, so every field that is not skipped must
//! be free of drop glue.

use proc_macro::TokenStream;
use quote::{format_ident, quote};
use syn::{Attribute, Data, DeriveInput, Fields, parse_macro_input, spanned::Spanned};

/// Derives `with_<field>`, `set_<field>` and `<field>` accessors.
///
/// # Example
///
/// ```
/// use utils_accessors_derive::Accessors;
///
/// #[derive(Accessors, Default)]
/// struct Tunables {
///     quantum_ms: u64,
///     enabled: bool,
///     #[accessors(no_get)]
///     name: &'static str,
///     #[accessors(skip)]
///     _private: (),
/// }
///
/// let mut t = Tunables::default().with_quantum_ms(10).with_enabled(true);
/// t.set_quantum_ms(20).set_name("core");
/// assert_eq!(t.quantum_ms(), 20);
/// assert!(t.enabled());
/// assert_eq!(t.name, "core");
/// ```
#[proc_macro_derive(Accessors, attributes(accessors))]
pub fn derive_accessors(input: TokenStream) -> TokenStream {
    let DeriveInput {
        ident,
        generics,
        data,
        ..
    } = parse_macro_input!(input as DeriveInput);

    let fields = match data {
        Data::Struct(s) => match s.fields {
            Fields::Named(n) => n.named,
            Fields::Unnamed(u) => {
                return syn::Error::new(u.span(), "Accessors only supports named fields")
                    .to_compile_error()
                    .into();
            }
            Fields::Unit => {
                return syn::Error::new(ident.span(), "Accessors does not apply to unit structs")
                    .to_compile_error()
                    .into();
            }
        },
        _ => {
            return syn::Error::new(ident.span(), "Accessors can only be derived for structs")
                .to_compile_error()
                .into();
        }
    };

    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let mut methods = Vec::new();
    for field in fields {
        let Some(fname) = &field.ident else { continue };
        let options = match FieldOptions::parse(&field.attrs) {
            Ok(options) => options,
            Err(e) => return e.to_compile_error().into(),
        };
        if options.skip {
            continue;
        }

        let ty = &field.ty;
        let set_name = format_ident!("set_{}", fname);
        let with_name = format_ident!("with_{}", fname);

        methods.push(quote! {
            #[inline]
            #[must_use]
            pub const fn #with_name(mut self, value: #ty) -> Self {
                self.#fname = value;
                self
            }

            #[inline]
            pub fn #set_name(&mut self, value: #ty) -> &mut Self {
                self.#fname = value;
                self
            }
        });

        if !options.no_get {
            methods.push(quote! {
                #[inline]
                #[must_use]
                pub const fn #fname(&self) -> #ty {
                    self.#fname
                }
            });
        }
    }

    let expanded = quote! {
        impl #impl_generics #ident #ty_generics #where_clause {
            #(#methods)*
        }
    };

    TokenStream::from(expanded)
}

#[derive(Default)]
struct FieldOptions {
    skip: bool,
    no_get: bool,
}

impl FieldOptions {
    fn parse(attrs: &[Attribute]) -> syn::Result<Self> {
        let mut options = Self::default();
        for attr in attrs.iter().filter(|a| a.path().is_ident("accessors")) {
            attr.parse_nested_meta(|meta| {
                if meta.path.is_ident("skip") {
                    options.skip = true;
                    Ok(())
                } else if meta.path.is_ident("no_get") {
                    options.no_get = true;
                    Ok(())
                } else {
                    Err(meta.error("expected `skip` or `no_get`"))
                }
            })?;
        }
        Ok(options)
    }
}
