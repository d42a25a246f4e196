//! Helper macros for `privileged`

use proc_macro2::TokenStream;
use quote::quote;
use syn::{
    ext::IdentExt,
    parenthesized,
    parse::{Parse, ParseStream},
    parse_macro_input,
    punctuated::Punctuated,
    Error, Expr, FnArg, Ident, ItemFn, Pat, Result, Token,
};

/// Mark a function as a privileged action.
///
/// The function itself is left untouched.  A module with the same name
/// is generated next to it; its `action()` returns the descriptor that
/// is registered with a `privileged::Module`.  Default values of
/// parameters are JSON values:
///
/// ```ignore
/// #[privileged(defaults(port = 22, comment = null))]
/// pub fn add_key(user: String, key: String, port: u16, comment: Option<String>) {}
/// ```
#[proc_macro_attribute]
pub fn privileged(
    attr: proc_macro::TokenStream,
    item: proc_macro::TokenStream,
) -> proc_macro::TokenStream {
    let attributes = parse_macro_input!(attr as Attributes);
    let function = parse_macro_input!(item as ItemFn);

    derive_privileged_fn(attributes, function)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

struct DefaultValue {
    name: Ident,
    value: Expr,
}

impl Parse for DefaultValue {
    fn parse(input: ParseStream) -> Result<Self> {
        let name = input.call(Ident::parse_any)?;
        input.parse::<Token![=]>()?;
        let value = input.parse()?;
        Ok(Self { name, value })
    }
}

#[derive(Default)]
struct Attributes {
    defaults: Vec<DefaultValue>,
}

impl Parse for Attributes {
    fn parse(input: ParseStream) -> Result<Self> {
        let mut attributes = Self::default();

        while !input.is_empty() {
            let keyword: Ident = input.parse()?;
            if keyword != "defaults" {
                return Err(Error::new(keyword.span(), "expected `defaults(...)`"));
            }

            let content;
            parenthesized!(content in input);
            attributes
                .defaults
                .extend(Punctuated::<DefaultValue, Token![,]>::parse_terminated(&content)?);

            if !input.is_empty() {
                input.parse::<Token![,]>()?;
            }
        }

        Ok(attributes)
    }
}

fn derive_privileged_fn(attributes: Attributes, function: ItemFn) -> Result<TokenStream> {
    let sig = &function.sig;

    if let Some(asyncness) = &sig.asyncness {
        return Err(Error::new_spanned(
            asyncness,
            "privileged actions cannot be async",
        ));
    }
    if !sig.generics.params.is_empty() {
        return Err(Error::new_spanned(
            &sig.generics,
            "privileged actions cannot be generic",
        ));
    }

    let mut defaults = attributes.defaults;
    let mut params = vec![];
    let mut bindings = vec![];
    let mut idents = vec![];

    for input in &sig.inputs {
        let pat_type = match input {
            FnArg::Typed(pat_type) => pat_type,
            FnArg::Receiver(receiver) => {
                return Err(Error::new_spanned(
                    receiver,
                    "privileged actions cannot take `self`",
                ))
            }
        };
        let ident = match &*pat_type.pat {
            Pat::Ident(pat) if pat.by_ref.is_none() && pat.subpat.is_none() => &pat.ident,
            pat => {
                return Err(Error::new_spanned(
                    pat,
                    "privileged action arguments must be plain names",
                ))
            }
        };
        let ty = &pat_type.ty;
        let name = ident.unraw().to_string();

        let default = match defaults
            .iter()
            .position(|default| default.name.unraw() == name)
        {
            Some(index) => {
                let value = defaults.remove(index).value;
                quote! { ::std::option::Option::Some(::privileged::__private::json!(#value)) }
            }
            None => quote! { ::std::option::Option::None },
        };

        params.push(quote! {
            ::privileged::Param {
                name: #name,
                ty: <#ty as ::privileged::ArgType>::descriptor(),
                default: #default,
            }
        });
        bindings.push(quote! {
            let #ident: #ty = ::privileged::Action::argument(&mut __arguments, #name)?;
        });
        idents.push(ident);
    }

    if let Some(default) = defaults.first() {
        return Err(Error::new(
            default.name.span(),
            format!("no parameter named `{}`", default.name.unraw()),
        ));
    }

    let vis = &function.vis;
    let ident = &sig.ident;
    let name = ident.unraw().to_string();

    Ok(quote! {
        #function

        #[allow(non_snake_case)]
        #vis mod #ident {
            #[allow(unused_imports)]
            use super::*;

            /// Descriptor of the privileged action.
            pub fn action() -> ::privileged::Action {
                ::privileged::Action::new(#name, ::std::vec![#(#params),*], invoke).privileged()
            }

            fn invoke(
                __arguments: ::std::vec::Vec<::privileged::__private::Value>,
            ) -> ::std::result::Result<::privileged::Outcome, ::privileged::Error> {
                #[allow(unused_mut, unused_variables)]
                let mut __arguments = __arguments.into_iter();
                #(#bindings)*
                ::std::result::Result::Ok(::privileged::IntoOutcome::into_outcome(
                    super::#ident(#(#idents),*),
                ))
            }
        }
    })
}
