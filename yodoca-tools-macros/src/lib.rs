//! Procedural macros for yodoca tool definitions.
//!
//! The `#[tool]` attribute decorates async functions and generates the
//! registration glue required for the loader to expose them to the
//! orchestrator's tool list.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::{format_ident, quote};
use syn::parse::{Parse, ParseStream};
use syn::parse_macro_input;
use syn::spanned::Spanned;
use syn::{Error, Expr, ItemFn, Lit, LitStr, MetaNameValue, Result, ReturnType, Type, parse_quote};

#[derive(Default)]
struct ToolArgs {
    name: Option<LitStr>,
    version: Option<LitStr>,
    description: Option<LitStr>,
}

impl ToolArgs {
    fn parse(args: Vec<MetaNameValue>) -> Result<Self> {
        let mut parsed = ToolArgs::default();
        for arg in args {
            let MetaNameValue { path, value, .. } = arg;
            if path.is_ident("name") {
                parsed.name = Some(expect_lit_str(value, "name")?);
            } else if path.is_ident("version") {
                parsed.version = Some(expect_lit_str(value, "version")?);
            } else if path.is_ident("description") {
                parsed.description = Some(expect_lit_str(value, "description")?);
            } else {
                return Err(Error::new(
                    path.span(),
                    "unsupported attribute key; expected one of `name`, `version`, or `description`",
                ));
            }
        }

        if parsed.name.is_none() {
            return Err(Error::new(
                Span::call_site(),
                "missing required attribute `name`",
            ));
        }

        if parsed.version.is_none() {
            return Err(Error::new(
                Span::call_site(),
                "missing required attribute `version`",
            ));
        }

        Ok(parsed)
    }
}

fn expect_lit_str(expr: Expr, field: &str) -> Result<LitStr> {
    match expr {
        Expr::Lit(syn::ExprLit {
            lit: Lit::Str(lit), ..
        }) => Ok(lit),
        other => Err(Error::new(
            other.span(),
            format!("`{field}` must be a string literal"),
        )),
    }
}

fn extract_success_type(output: &ReturnType) -> Result<Type> {
    match output {
        ReturnType::Type(_, ty) => match ty.as_ref() {
            Type::Path(path) => {
                let last = path.path.segments.last().ok_or_else(|| {
                    Error::new(path.span(), "unsupported return type for tool function")
                })?;
                if last.ident != "ToolResult" {
                    return Err(Error::new(
                        last.ident.span(),
                        "tool functions must return yodoca_tools::registry::ToolResult<T>",
                    ));
                }
                match &last.arguments {
                    syn::PathArguments::AngleBracketed(args) => {
                        if args.args.len() != 1 {
                            return Err(Error::new(
                                args.span(),
                                "ToolResult must contain exactly one generic argument",
                            ));
                        }
                        match &args.args[0] {
                            syn::GenericArgument::Type(ty) => Ok((*ty).clone()),
                            other => Err(Error::new(
                                other.span(),
                                "ToolResult generic argument must be a concrete type",
                            )),
                        }
                    }
                    syn::PathArguments::None => Err(Error::new(
                        last.arguments.span(),
                        "ToolResult must specify a success type",
                    )),
                    other @ syn::PathArguments::Parenthesized(_) => Err(Error::new(
                        other.span(),
                        "unsupported ToolResult generic arguments",
                    )),
                }
            }
            other => Err(Error::new(
                other.span(),
                "unsupported return type for tool function",
            )),
        },
        ReturnType::Default => Err(Error::new(
            Span::call_site(),
            "tool functions must return yodoca_tools::registry::ToolResult<T>",
        )),
    }
}

struct ToolAttrInput {
    entries: Vec<MetaNameValue>,
}

impl Parse for ToolAttrInput {
    fn parse(input: ParseStream<'_>) -> Result<Self> {
        let mut entries = Vec::new();
        while !input.is_empty() {
            entries.push(input.parse()?);
            if input.peek(syn::Token![,]) {
                let _ = input.parse::<syn::Token![,]>()?;
            }
        }
        Ok(Self { entries })
    }
}

#[proc_macro_attribute]
#[allow(clippy::too_many_lines, clippy::missing_panics_doc)]
pub fn tool(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args_tokens = parse_macro_input!(attr as ToolAttrInput);
    let args = match ToolArgs::parse(args_tokens.entries) {
        Ok(args) => args,
        Err(err) => return err.to_compile_error().into(),
    };

    let mut function = parse_macro_input!(item as ItemFn);

    if function.sig.asyncness.is_none() {
        return Error::new(function.sig.ident.span(), "tool functions must be async")
            .to_compile_error()
            .into();
    }

    let mut arguments = Vec::new();
    for arg in &function.sig.inputs {
        match arg {
            syn::FnArg::Typed(pat_type) => {
                let ident = match pat_type.pat.as_ref() {
                    syn::Pat::Ident(pat_ident) => pat_ident.ident.clone(),
                    other => {
                        return Error::new(
                            other.span(),
                            "tool parameters must be simple identifiers",
                        )
                        .to_compile_error()
                        .into();
                    }
                };
                arguments.push((ident, (*pat_type.ty).clone()));
            }
            syn::FnArg::Receiver(_) => {
                return Error::new(
                    function.sig.inputs.span(),
                    "tool functions cannot take `self` receivers",
                )
                .to_compile_error()
                .into();
            }
        }
    }
    if arguments.is_empty() {
        return Error::new(
            function.sig.span(),
            "tool functions must accept at least one argument",
        )
        .to_compile_error()
        .into();
    }

    let original_output = function.sig.output.clone();
    let success_ty = match extract_success_type(&original_output) {
        Ok(ty) => ty,
        Err(err) => return err.to_compile_error().into(),
    };

    let name_lit = args.name.expect("name checked above");
    let version_lit = args.version.expect("version checked above");

    let description_stmt = args.description.map(|desc| {
        quote! {
            metadata = metadata.with_description(#desc);
        }
    });

    let decode_arguments = if arguments.len() == 1 {
        let (ident, ty) = &arguments[0];
        quote! {
            let #ident: #ty = ::serde_json::from_value(input).map_err(|err| {
                ::yodoca_tools::registry::ToolError::execution(format!(
                    "failed to decode `{}` payload: {err}",
                    #name_lit,
                ))
            })?;
        }
    } else {
        let field_decoders = arguments.iter().map(|(ident, ty)| {
            let field_name = ident.to_string();
            quote! {
                let value = map.remove(#field_name).ok_or_else(|| {
                    ::yodoca_tools::registry::ToolError::execution(format!(
                        "tool `{}` missing field `{}`",
                        #name_lit,
                        #field_name,
                    ))
                })?;
                let #ident: #ty = ::serde_json::from_value(value).map_err(|err| {
                    ::yodoca_tools::registry::ToolError::execution(format!(
                        "failed to decode `{}` field `{}`: {err}",
                        #name_lit,
                        #field_name,
                    ))
                })?;
            }
        });
        quote! {
            let mut map = match input {
                ::serde_json::Value::Object(map) => map,
                _other => {
                    return Err(::yodoca_tools::registry::ToolError::execution(format!(
                        "tool `{}` expects an object payload",
                        #name_lit,
                    )));
                }
            };
            #(#field_decoders)*
        }
    };
    let arg_idents: Vec<_> = arguments.iter().map(|(ident, _)| ident).collect();

    let fn_ident = &function.sig.ident;
    let binding_ident = format_ident!("{}_binding", fn_ident);
    let register_ident = format_ident!("register_{}", fn_ident);
    let vis = &function.vis;

    let expanded = quote! {
        #function

        #vis fn #binding_ident() -> ::yodoca_tools::registry::ToolResult<::yodoca_tools::registry::ToolBinding> {
            let mut metadata = ::yodoca_tools::registry::ToolMetadata::new(#name_lit, #version_lit)?;
            #description_stmt

            Ok(::yodoca_tools::registry::ToolBinding::new(
                metadata,
                |input: ::serde_json::Value| -> ::yodoca_tools::registry::ToolFuture {
                    ::std::boxed::Box::pin(async move {
                        #decode_arguments
                        let result: #success_ty = #fn_ident(#(#arg_idents),*).await?;
                        let json = ::serde_json::to_value(result).map_err(|err| {
                            ::yodoca_tools::registry::ToolError::execution(format!(
                                "failed to encode `{}` response: {err}",
                                #name_lit,
                            ))
                        })?;
                        Ok(json)
                    })
                },
            ))
        }

        #vis fn #register_ident(
            registry: &::yodoca_tools::registry::ToolRegistry,
        ) -> ::yodoca_tools::registry::ToolResult<()> {
            let binding = #binding_ident()?;
            registry.register_binding(binding)
        }

        ::yodoca_tools::inventory::submit! {
            ::yodoca_tools::registry::ToolRegistration(#binding_ident)
        }
    };

    TokenStream::from(expanded)
}
