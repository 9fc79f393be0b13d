//! `spark-intercept` 过程宏入口。
//!
//! # 设计意图（Why）
//! - 为每个可拦截接口在编译期生成“代理对象”与“分发表”，业务代码无需手写任何转发样板；
//! - 生成代码只依赖 `spark_intercept` 的公开契约（`Interface`、`Dispatch`、`Intercept`、`InterceptionEngine`），
//!   使运行时内核与接口定义彼此解耦。
//!
//! # 集成方式（How）
//! - 在 trait 上标注 `#[spark_intercept::interceptable]`；包含 `async fn` 时宏会自动追加
//!   `#[spark_intercept::async_trait]`，若手动标注 `#[async_trait]`，需将其放在本属性下方；
//! - 实现方照常 `impl Trait for Impl`（含异步方法时同样标注 `#[async_trait]`），
//!   再通过 `InterceptRegistry` 或 `create_interceptor` 取得 `<Trait>Interceptor` 代理。

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{
    Error, FnArg, GenericArgument, Ident, ItemTrait, Pat, PathArguments, ReturnType, Signature,
    TraitItem, Type, parse_macro_input, parse_quote, spanned::Spanned,
};

/// 为 trait 生成拦截代理与分发表。
///
/// # 语义说明（What）
/// - **输入**：无泛型、无 `where` 子句的 trait，仅包含方法；每个方法以 `&self` 为接收者，
///   参数按值传递（类型需满足 `Clone + Send + Sync + 'static`），返回 `Result<T, E>`；
/// - **输出**：原 trait、`impl Interface for dyn Trait`（方法描述表）、
///   `impl<S: Trait> Dispatch<S> for dyn Trait`（终端分发）、`impl Intercept for dyn Trait`
///   以及实现了该 trait 的 `<Trait>Interceptor` 代理；
/// - **返回形状**：同步方法为值形状；`async fn` 返回 `Result<(), E>` 为完成形状，其余为类型化结果形状。
///
/// # 风险提示（Trade-offs）
/// - 错误类型 `E` 需实现 `std::error::Error + From<InterceptError> + Send + Sync + 'static`，
///   否则引擎无法在边缘还原错误；
/// - 引用参数与 `impl Trait` 参数无法被擦除进参数列表，会在编译期被拒绝。
#[proc_macro_attribute]
pub fn interceptable(attr: TokenStream, item: TokenStream) -> TokenStream {
    if !attr.is_empty() {
        return Error::new(
            proc_macro2::Span::call_site(),
            "#[interceptable] 不接受参数",
        )
        .to_compile_error()
        .into();
    }

    let item = parse_macro_input!(item as ItemTrait);
    expand_interceptable(item)
        .unwrap_or_else(|err| err.to_compile_error())
        .into()
}

/// 单个方法在展开时需要的全部信息。
struct MethodModel {
    ident: Ident,
    index: usize,
    params: Vec<ParamModel>,
    output: Type,
    error: Type,
    shape: Shape,
}

struct ParamModel {
    name: String,
    ty: Type,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Shape {
    Value,
    Completion,
    Result,
}

impl Shape {
    fn variant(self) -> Ident {
        let name = match self {
            Shape::Value => "Value",
            Shape::Completion => "Completion",
            Shape::Result => "Result",
        };
        Ident::new(name, proc_macro2::Span::call_site())
    }
}

fn expand_interceptable(mut item: ItemTrait) -> Result<TokenStream2, Error> {
    if !item.generics.params.is_empty() || item.generics.where_clause.is_some() {
        return Err(Error::new(
            item.generics.span(),
            "#[interceptable] 暂不支持带泛型参数或 where 子句的 trait",
        ));
    }

    let mut methods = Vec::new();
    for trait_item in &item.items {
        match trait_item {
            TraitItem::Fn(method) => {
                let index = methods.len();
                methods.push(analyze_method(&method.sig, index)?);
            }
            other => {
                return Err(Error::new(
                    other.span(),
                    "#[interceptable] 仅支持方法，不支持关联类型、常量或宏",
                ));
            }
        }
    }

    let has_async = methods.iter().any(|m| m.shape != Shape::Value);
    if has_async && !has_async_trait(&item.attrs) {
        item.attrs.push(parse_quote!(#[::spark_intercept::async_trait]));
    }

    let trait_ident = item.ident.clone();
    let vis = item.vis.clone();
    let proxy_ident = format_ident!("{}Interceptor", trait_ident);
    let service_name = trait_ident.to_string();

    let descriptor_table = expand_descriptors(&service_name, &methods);
    let dispatch_arms = methods.iter().map(|m| expand_dispatch_arm(&trait_ident, m));
    let proxy_methods = methods.iter().map(|m| expand_proxy_method(&trait_ident, m));
    let proxy_async_attr = has_async.then(|| quote!(#[::spark_intercept::async_trait]));
    let proxy_doc = format!("`{service_name}` 的拦截代理：每次调用都经由引擎驱动已编译的中间件链路。");

    Ok(quote! {
        #item

        impl ::spark_intercept::Interface for dyn #trait_ident {
            const NAME: &'static str = #service_name;
            const METHODS: &'static [::spark_intercept::MethodDescriptor] = #descriptor_table;
        }

        #[allow(unused_mut, unused_variables)]
        impl<__S> ::spark_intercept::Dispatch<__S> for dyn #trait_ident
        where
            __S: #trait_ident + ::core::marker::Send + ::core::marker::Sync + 'static,
        {
            fn dispatch(
                target: ::std::sync::Arc<__S>,
                method: &'static ::spark_intercept::MethodDescriptor,
                mut arguments: ::spark_intercept::Arguments,
            ) -> ::spark_intercept::Invocation {
                let known = <dyn #trait_ident as ::spark_intercept::Interface>::method(method.index());
                if !known.is_some_and(|known| known.service() == method.service() && known.name() == method.name()) {
                    return ::spark_intercept::Invocation::failed(
                        ::spark_intercept::InterceptError::unknown_method(method),
                    );
                }
                match method.index() {
                    #(#dispatch_arms)*
                    _ => ::spark_intercept::Invocation::failed(
                        ::spark_intercept::InterceptError::unknown_method(method),
                    ),
                }
            }
        }

        #[doc = #proxy_doc]
        #[derive(Debug)]
        #vis struct #proxy_ident {
            engine: ::spark_intercept::InterceptionEngine,
        }

        impl #proxy_ident {
            /// 以引擎构造代理，引擎可在之后再装配。
            pub fn new(engine: ::spark_intercept::InterceptionEngine) -> Self {
                Self { engine }
            }

            /// 以尚未装配的引擎构造代理，装配前的调用返回 `NotConfigured`。
            pub fn unconfigured() -> Self {
                Self::new(::spark_intercept::InterceptionEngine::new())
            }

            pub fn engine(&self) -> &::spark_intercept::InterceptionEngine {
                &self.engine
            }
        }

        impl ::spark_intercept::Intercept for dyn #trait_ident {
            type Proxy = #proxy_ident;

            fn from_engine(engine: ::spark_intercept::InterceptionEngine) -> Self::Proxy {
                #proxy_ident::new(engine)
            }
        }

        #proxy_async_attr
        impl #trait_ident for #proxy_ident {
            #(#proxy_methods)*
        }
    })
}

fn has_async_trait(attrs: &[syn::Attribute]) -> bool {
    attrs.iter().any(|attr| {
        attr.path()
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "async_trait")
    })
}

fn analyze_method(sig: &Signature, index: usize) -> Result<MethodModel, Error> {
    if !sig.generics.params.is_empty() || sig.generics.where_clause.is_some() {
        return Err(Error::new(
            sig.generics.span(),
            "#[interceptable] 暂不支持带泛型参数的方法",
        ));
    }
    if sig.constness.is_some() || sig.unsafety.is_some() || sig.variadic.is_some() {
        return Err(Error::new(
            sig.span(),
            "#[interceptable] 不支持 const、unsafe 或可变参数方法",
        ));
    }

    let mut inputs = sig.inputs.iter();
    match inputs.next() {
        Some(FnArg::Receiver(receiver))
            if receiver.reference.is_some()
                && receiver.mutability.is_none()
                && receiver.colon_token.is_none() => {}
        _ => {
            return Err(Error::new(
                sig.span(),
                "#[interceptable] 要求方法以 `&self` 为接收者",
            ));
        }
    }

    let mut params = Vec::new();
    for input in inputs {
        let FnArg::Typed(typed) = input else {
            return Err(Error::new(input.span(), "接收者只能出现在首位"));
        };
        match typed.ty.as_ref() {
            Type::Reference(_) | Type::ImplTrait(_) => {
                return Err(Error::new(
                    typed.ty.span(),
                    "#[interceptable] 参数必须按值传递且类型具体，引用参数请改用 `Arc<T>` 或拥有所有权的类型",
                ));
            }
            _ => {}
        }
        let name = match typed.pat.as_ref() {
            Pat::Ident(ident) => ident.ident.to_string(),
            _ => "_".to_owned(),
        };
        params.push(ParamModel {
            name,
            ty: (*typed.ty).clone(),
        });
    }

    let (output, error) = extract_result_types(sig)?;
    let shape = match (sig.asyncness.is_some(), is_unit(&output)) {
        (false, _) => Shape::Value,
        (true, true) => Shape::Completion,
        (true, false) => Shape::Result,
    };

    Ok(MethodModel {
        ident: sig.ident.clone(),
        index,
        params,
        output,
        error,
        shape,
    })
}

fn is_unit(ty: &Type) -> bool {
    matches!(ty, Type::Tuple(tuple) if tuple.elems.is_empty())
}

fn extract_result_types(sig: &Signature) -> Result<(Type, Type), Error> {
    const HINT: &str = "#[interceptable] 要求方法返回 Result<T, E>；若同时使用 #[async_trait]，请将 #[interceptable] 置于其上方";
    let ReturnType::Type(_, ty) = &sig.output else {
        return Err(Error::new(sig.span(), HINT));
    };
    let Type::Path(type_path) = ty.as_ref() else {
        return Err(Error::new(ty.span(), HINT));
    };
    let segment = type_path
        .path
        .segments
        .last()
        .ok_or_else(|| Error::new(type_path.span(), "返回类型缺失"))?;
    if segment.ident != "Result" {
        return Err(Error::new(segment.ident.span(), HINT));
    }
    let PathArguments::AngleBracketed(args) = &segment.arguments else {
        return Err(Error::new(segment.arguments.span(), "Result 泛型参数解析失败"));
    };
    let mut generics = args.args.iter();
    let output = match generics.next() {
        Some(GenericArgument::Type(ty)) => ty.clone(),
        _ => return Err(Error::new(args.span(), "Result 必须提供结果类型")),
    };
    let error = match generics.next() {
        Some(GenericArgument::Type(ty)) => ty.clone(),
        _ => return Err(Error::new(args.span(), "Result 必须提供错误类型")),
    };
    Ok((output, error))
}

/// 生成方法描述表。参数表先落成具名常量，保证其为 `'static`。
fn expand_descriptors(service: &str, methods: &[MethodModel]) -> TokenStream2 {
    let param_consts = methods.iter().map(|m| {
        let const_ident = format_ident!("__PARAMS_{}", m.index);
        let entries = m.params.iter().map(|p| {
            let name = &p.name;
            let type_name = type_label(&p.ty);
            quote!(::spark_intercept::ParamDescriptor::new(#name, #type_name))
        });
        quote! {
            const #const_ident: &[::spark_intercept::ParamDescriptor] = &[#(#entries),*];
        }
    });
    let descriptors = methods.iter().map(|m| {
        let const_ident = format_ident!("__PARAMS_{}", m.index);
        let name = m.ident.to_string();
        let index = m.index;
        let output = type_label(&m.output);
        let shape = m.shape.variant();
        quote! {
            ::spark_intercept::MethodDescriptor::new(
                #service,
                #name,
                #index,
                #const_ident,
                #output,
                ::spark_intercept::ReturnShape::#shape,
            )
        }
    });
    quote! {{
        #(#param_consts)*
        &[#(#descriptors),*]
    }}
}

fn expand_dispatch_arm(trait_ident: &Ident, method: &MethodModel) -> TokenStream2 {
    let index = method.index;
    let ident = &method.ident;
    let bindings: Vec<Ident> = (0..method.params.len())
        .map(|i| format_ident!("__arg{}", i))
        .collect();
    let takes = method.params.iter().zip(&bindings).enumerate().map(|(i, (p, binding))| {
        let ty = &p.ty;
        quote! {
            let #binding = match arguments.take::<#ty>(#i) {
                ::core::result::Result::Ok(value) => value,
                ::core::result::Result::Err(err) => {
                    return ::spark_intercept::Invocation::failed(err);
                }
            };
        }
    });
    let call = match method.shape {
        Shape::Value => quote! {
            ::spark_intercept::Invocation::ready(
                <__S as #trait_ident>::#ident(&*target, #(#bindings),*),
            )
        },
        Shape::Completion | Shape::Result => quote! {
            ::spark_intercept::Invocation::pending(async move {
                <__S as #trait_ident>::#ident(&*target, #(#bindings),*).await
            })
        },
    };
    quote! {
        #index => {
            #(#takes)*
            #call
        }
    }
}

fn expand_proxy_method(trait_ident: &Ident, method: &MethodModel) -> TokenStream2 {
    let index = method.index;
    let ident = &method.ident;
    let output = &method.output;
    let error = &method.error;
    let bindings: Vec<Ident> = (0..method.params.len())
        .map(|i| format_ident!("__arg{}", i))
        .collect();
    let inputs = method.params.iter().zip(&bindings).map(|(p, binding)| {
        let ty = &p.ty;
        quote!(#binding: #ty)
    });
    let arguments = if bindings.is_empty() {
        quote!(::core::option::Option::None)
    } else {
        quote! {
            ::core::option::Option::Some(
                ::spark_intercept::Arguments::new()#(.with(#bindings))*
            )
        }
    };
    let descriptor = quote!(<dyn #trait_ident as ::spark_intercept::Interface>::method(#index));

    match method.shape {
        Shape::Value => quote! {
            fn #ident(&self, #(#inputs),*) -> ::core::result::Result<#output, #error> {
                self.engine.invoke_value::<#output, #error>(#descriptor, #arguments)
            }
        },
        Shape::Completion => quote! {
            async fn #ident(&self, #(#inputs),*) -> ::core::result::Result<#output, #error> {
                self.engine.invoke_completion::<#error>(#descriptor, #arguments).await
            }
        },
        Shape::Result => quote! {
            async fn #ident(&self, #(#inputs),*) -> ::core::result::Result<#output, #error> {
                self.engine.invoke_result::<#output, #error>(#descriptor, #arguments).await
            }
        },
    }
}

/// 把类型记号渲染为紧凑的可读类型名，例如 `HashMap<String, u32>`。
fn type_label(ty: &Type) -> String {
    let raw = quote!(#ty).to_string();
    let chars: Vec<char> = raw.chars().collect();
    let mut label = String::with_capacity(raw.len());
    for (i, &c) in chars.iter().enumerate() {
        if c != ' ' {
            label.push(c);
            continue;
        }
        let prev = label.chars().last();
        let next = chars.get(i + 1).copied();
        let word = |c: Option<char>| c.is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '\'');
        if prev == Some(',') || (word(prev) && word(next)) {
            label.push(' ');
        }
    }
    label
}
