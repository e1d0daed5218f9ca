//! Derive macros for the `Trace` and `Cell` traits.

use proc_macro2::TokenStream;
use quote::{format_ident, quote, quote_spanned};
use syn::{
    parse_macro_input, parse_quote, spanned::Spanned, Data, DeriveInput, Field, Fields,
    GenericParam, Generics, Index, Member, Path, TypeParamBound,
};

/// Options shared by both derives, parsed from `#[gengc(...)]`.
struct GengcAttrs {
    krate: Path,
    leaf: bool,
}

fn parse_attrs(input: &DeriveInput) -> Result<GengcAttrs, syn::Error> {
    let mut attrs = GengcAttrs {
        krate: parse_quote!(::gengc),
        leaf: false,
    };

    for attr in &input.attrs {
        if !attr.path().is_ident("gengc") {
            continue;
        }

        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("crate") {
                attrs.krate = meta.value()?.parse()?;
                Ok(())
            } else if meta.path.is_ident("leaf") {
                attrs.leaf = true;
                Ok(())
            } else {
                Err(meta.error("unsupported attribute"))
            }
        })?;
    }

    Ok(attrs)
}

/// Implements `Trace` by visiting every field in declaration order.
///
/// Fields marked `#[gengc(skip)]` are not visited and need not implement
/// `Trace`.
#[proc_macro_derive(Trace, attributes(gengc))]
pub fn derive_trace(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let attrs = match parse_attrs(&input) {
        Ok(attrs) => attrs,
        Err(err) => return err.into_compile_error().into(),
    };
    let gengc = &attrs.krate;

    let name = &input.ident;
    let generics = add_trait_bounds(gengc, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let trace_body = match generate_trace_body(gengc, &input.data) {
        Ok(body) => body,
        Err(err) => return err.into_compile_error().into(),
    };

    let generated = quote! {
        unsafe impl #impl_generics #gengc::Trace for #name #ty_generics #where_clause {
            #[inline]
            #[allow(unused_variables)]
            fn trace(&self, visitor: &mut #gengc::SlotVisitor<'_>) {
                #trace_body
            }
        }
    };

    generated.into()
}

/// Implements `Cell` with the default structural visitation.
///
/// `#[gengc(leaf)]` declares the type non-compound, so the marker skips
/// child visitation entirely.
#[proc_macro_derive(Cell, attributes(gengc))]
pub fn derive_cell(input: proc_macro::TokenStream) -> proc_macro::TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    let attrs = match parse_attrs(&input) {
        Ok(attrs) => attrs,
        Err(err) => return err.into_compile_error().into(),
    };
    let gengc = &attrs.krate;

    let name = &input.ident;
    let generics = add_trait_bounds(gengc, input.generics.clone());
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();
    let compound = if attrs.leaf {
        quote! { const IS_COMPOUND: bool = false; }
    } else {
        quote! {}
    };

    let generated = quote! {
        unsafe impl #impl_generics #gengc::Cell for #name #ty_generics #where_clause {
            #compound
        }
    };

    generated.into()
}

fn add_trait_bounds(gengc: &Path, mut generics: Generics) -> Generics {
    for param in &mut generics.params {
        let GenericParam::Type(type_param) = param else {
            continue;
        };
        let mut traced = false;
        let mut is_static = false;
        for bound in &type_param.bounds {
            match bound {
                TypeParamBound::Trait(t) => {
                    traced |= t.path.segments.last().is_some_and(|s| s.ident == "Trace");
                }
                TypeParamBound::Lifetime(l) => is_static |= l.ident == "static",
                _ => {}
            }
        }
        if !traced {
            type_param.bounds.push(parse_quote!(#gengc::Trace));
        }
        if !is_static {
            type_param.bounds.push(parse_quote!('static));
        }
    }
    generics
}

/// Whether a field carries `#[gengc(skip)]`.
fn is_skipped(field: &Field) -> syn::Result<bool> {
    let mut skip = false;
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("gengc")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("skip") {
                skip = true;
                Ok(())
            } else {
                Err(meta.error("unsupported field attribute"))
            }
        })?;
    }
    Ok(skip)
}

/// Destructuring pattern for `fields` plus one visit per traced binding.
fn bind_fields(gengc: &Path, fields: &Fields) -> syn::Result<(TokenStream, TokenStream)> {
    let mut patterns = Vec::new();
    let mut visits = Vec::new();
    for (i, field) in fields.iter().enumerate() {
        let binding = format_ident!("__field{}", i);
        let member = field
            .ident
            .clone()
            .map_or_else(|| Member::Unnamed(Index::from(i)), Member::Named);
        if is_skipped(field)? {
            continue;
        }
        patterns.push(quote! { #member: #binding });
        visits.push(quote_spanned! {field.span() =>
            #gengc::Trace::trace(#binding, visitor);
        });
    }
    let pattern = match fields {
        Fields::Unit => quote! {},
        _ => quote! { { #(#patterns,)* .. } },
    };
    Ok((pattern, quote! { #(#visits)* }))
}

fn generate_trace_body(gengc: &Path, data: &Data) -> syn::Result<TokenStream> {
    match data {
        Data::Struct(data) => {
            let (pattern, visits) = bind_fields(gengc, &data.fields)?;
            Ok(quote! {
                let Self #pattern = self;
                #visits
            })
        }
        Data::Enum(data) => {
            let arms = data
                .variants
                .iter()
                .map(|variant| {
                    let ident = &variant.ident;
                    let (pattern, visits) = bind_fields(gengc, &variant.fields)?;
                    Ok(quote! { Self::#ident #pattern => { #visits } })
                })
                .collect::<syn::Result<Vec<_>>>()?;
            Ok(quote! {
                match self {
                    #(#arms)*
                }
            })
        }
        Data::Union(u) => Err(syn::Error::new(
            u.union_token.span,
            "`Trace` must be implemented by hand for unions",
        )),
    }
}
