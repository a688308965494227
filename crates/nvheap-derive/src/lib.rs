//! Derive macro for the `Trace` trait.
//!
//! ```ignore
//! use nvheap::{Pptr, Trace};
//!
//! #[derive(Trace)]
//! struct Node {
//!     key: u64,
//!     left: Pptr<Node>,
//!     right: Pptr<Node>,
//! }
//! ```
//!
//! Inside `nvheap` itself, or behind a re-export, point the generated code at
//! the right path with `#[nvheap(crate = path)]`.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Fields, GenericParam,
    Generics, Ident, Index, Path,
};

#[proc_macro_derive(Trace, attributes(nvheap))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let mut nvheap: Path = parse_quote!(::nvheap);

    for attr in &input.attrs {
        if !attr.path().is_ident("nvheap") {
            continue;
        }

        let result = attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                nvheap = meta.value()?.parse()?;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        });

        if let Err(err) = result {
            return err.into_compile_error().into();
        }
    }

    let name = &input.ident;
    let generics = add_trait_bounds(&nvheap, input.generics);
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = generate_trace_body(&nvheap, name, &input.data);

    let generated = quote! {
        unsafe impl #impl_generics #nvheap::Trace for #name #ty_generics #where_clause {
            #[inline]
            fn trace(&self, visitor: &mut impl #nvheap::Visitor) {
                #trace_body
            }
        }
    };

    generated.into()
}

/// Adds a `Trace` bound to every type parameter that lacks one.
fn add_trait_bounds(nvheap: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        if let GenericParam::Type(ref mut type_param) = *param {
            let has_trace = type_param.bounds.iter().any(|b| {
                if let syn::TypeParamBound::Trait(t) = b {
                    t.path.segments.last().is_some_and(|s| s.ident == "Trace")
                } else {
                    false
                }
            });

            if !has_trace {
                type_param.bounds.push(parse_quote!(#nvheap::Trace));
            }
        }
    }
    generics
}

fn generate_trace_body(nvheap: &Path, name: &Ident, data: &Data) -> TokenStream {
    match data {
        Data::Struct(data) => generate_struct_trace(nvheap, &data.fields),
        Data::Enum(data) => generate_enum_trace(nvheap, name, data),
        Data::Union(u) => {
            quote_spanned! {
                u.union_token.span => compile_error!("`Trace` must be manually implemented for unions");
            }
        }
    }
}

fn generate_struct_trace(nvheap: &Path, fields: &Fields) -> TokenStream {
    match fields {
        Fields::Named(f) => {
            let trace_calls = f.named.iter().map(|field| {
                let name = &field.ident;
                quote_spanned! {field.span() =>
                    #nvheap::Trace::trace(&self.#name, visitor);
                }
            });
            quote! { #(#trace_calls)* }
        }
        Fields::Unnamed(f) => {
            let trace_calls = f.unnamed.iter().enumerate().map(|(i, field)| {
                let index = Index::from(i);
                quote_spanned! {field.span() =>
                    #nvheap::Trace::trace(&self.#index, visitor);
                }
            });
            quote! { #(#trace_calls)* }
        }
        Fields::Unit => quote! {},
    }
}

fn generate_enum_trace(nvheap: &Path, name: &Ident, data: &syn::DataEnum) -> TokenStream {
    let match_arms = data.variants.iter().map(|variant| {
        let var_name = &variant.ident;
        match &variant.fields {
            Fields::Named(f) => {
                let bindings: Vec<_> = (0..f.named.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let field_idents = f.named.iter().map(|f| &f.ident);
                let trace_calls = bindings.iter().map(|field| {
                    quote! { #nvheap::Trace::trace(#field, visitor); }
                });

                quote! {
                    #name::#var_name { #(#field_idents: #bindings),* } => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unnamed(f) => {
                let bindings: Vec<_> = (0..f.unnamed.len())
                    .map(|i| format_ident!("field{}", i))
                    .collect();
                let trace_calls = bindings.iter().map(|field| {
                    quote! { #nvheap::Trace::trace(#field, visitor); }
                });

                quote! {
                    #name::#var_name(#(#bindings),*) => {
                        #(#trace_calls)*
                    }
                }
            }
            Fields::Unit => {
                quote! {
                    #name::#var_name => {}
                }
            }
        }
    });

    quote! {
        match self {
            #(#match_arms)*
        }
    }
}
