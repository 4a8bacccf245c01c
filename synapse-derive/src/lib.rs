use proc_macro::TokenStream;
use proc_macro_crate::{FoundCrate, crate_name};
use quote::quote;
use syn::{
    Attribute, Data, DeriveInput, Error, Fields, GenericArgument, Ident, PathArguments, ReturnType,
    Type, TypePath, parse_macro_input, spanned::Spanned,
};

/// Derive macro for the `Payload` trait.
///
/// Queue item types are copied and overwritten by the ring buffers without
/// destructor calls, and may be mapped into other processes by the
/// shared-memory queues. This macro generates the `unsafe impl Payload` after
/// verifying at compile time that the type is a plain byte pattern.
///
/// # Compile-Time Checks
///
/// 1. **Stable layout**: the type must carry `#[repr(C)]`,
///    `#[repr(transparent)]`, or for enums a primitive representation such as
///    `#[repr(u8)]`. The default Rust layout may change between compiler
///    versions, which would corrupt cross-process queues.
///
/// 2. **No pointer types**: fields cannot contain types that hold pointers or
///    process-local handles. Forbidden types include:
///    - Heap allocations: `Vec`, `Box`, `String`, `PathBuf`, `OsString`, `CString`
///    - Reference counting: `Rc`, `Arc`
///    - References: `&T`, `&mut T`
///    - Raw pointers: `*const T`, `*mut T`
///    - Process-local synchronization: `Mutex`, `RwLock`, `Condvar`, `Barrier`
///
/// 3. **Recursive safety**: every field type must itself implement `Payload`,
///    enforced via generated where-clauses. Combined with the `Copy` bound on
///    the trait, this rules out `Drop` types.
///
/// # Example
///
/// ```
/// use synapse::Payload;
///
/// #[derive(Clone, Copy, Payload)]
/// #[repr(C)]
/// struct Tick {
///     sequence: u64,
///     price: f64,
///     flags: [u8; 4],
/// }
/// ```
///
/// # Compile Errors
///
/// ```compile_fail
/// # use synapse::Payload;
/// #[derive(Clone, Copy, Payload)]
/// struct MissingRepr {  // Error: requires #[repr(C)]
///     x: u32,
/// }
/// ```
///
/// ```compile_fail
/// # use synapse::Payload;
/// #[derive(Clone, Payload)]
/// #[repr(C)]
/// struct HasPointer {
///     data: Vec<u8>,  // Error: Vec contains heap allocation
/// }
/// ```
#[proc_macro_derive(Payload)]
pub fn derive_payload(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);

    match derive_payload_impl(input) {
        Ok(tokens) => tokens,
        Err(err) => err.to_compile_error().into(),
    }
}

fn get_crate_path() -> proc_macro2::TokenStream {
    match crate_name("synapse") {
        Ok(FoundCrate::Itself) => {
            quote!(::synapse)
        }
        Ok(FoundCrate::Name(name)) => {
            let ident = syn::Ident::new(&name, proc_macro2::Span::call_site());
            quote!(::#ident)
        }
        Err(_) => {
            quote!(::synapse)
        }
    }
}

fn derive_payload_impl(input: DeriveInput) -> syn::Result<TokenStream> {
    check_repr(&input)?;

    let field_types = get_field_types(&input.data)?;
    field_types.iter().try_for_each(check_types)?;

    let name = &input.ident;
    let generics = &input.generics;
    let (impl_generics, ty_generics, where_clause) = generics.split_for_impl();

    let crate_path = get_crate_path();

    let mut where_predicates = where_clause
        .map(|w| w.predicates.iter().cloned().collect::<Vec<_>>())
        .unwrap_or_default();

    for ty in &field_types {
        where_predicates.push(syn::parse_quote! {
            #ty: #crate_path::__PayloadPrivate
        });
    }

    let expanded = if where_predicates.is_empty() {
        quote! {
            unsafe impl #impl_generics #crate_path::__PayloadPrivate for #name #ty_generics #where_clause {}
        }
    } else {
        quote! {
            unsafe impl #impl_generics #crate_path::__PayloadPrivate for #name #ty_generics
            where
                #(#where_predicates),*
            {}
        }
    };

    Ok(expanded.into())
}

fn is_valid_repr_ident(ident: &syn::Ident) -> bool {
    ident == "C"
        || ident == "transparent"
        || ident == "u8"
        || ident == "u16"
        || ident == "u32"
        || ident == "u64"
        || ident == "u128"
        || ident == "usize"
        || ident == "i8"
        || ident == "i16"
        || ident == "i32"
        || ident == "i64"
        || ident == "i128"
        || ident == "isize"
}

fn has_valid_repr(attr: &Attribute) -> syn::Result<bool> {
    if !attr.path().is_ident("repr") {
        return Ok(false);
    }

    let mut valid = false;

    attr.parse_nested_meta(|meta| {
        if let Some(ident) = meta.path.get_ident()
            && is_valid_repr_ident(ident)
        {
            valid = true;
        }
        // Consume arguments of modifiers like align(64) / packed(N) so they
        // can coexist with a layout repr.
        if meta.input.peek(syn::token::Paren) {
            let content;
            syn::parenthesized!(content in meta.input);
            content.parse::<proc_macro2::TokenStream>()?;
        }
        Ok(())
    })?;

    Ok(valid)
}

fn check_repr(input: &DeriveInput) -> syn::Result<()> {
    let has_valid =
        input.attrs.iter().try_fold(
            false,
            |acc, attr| {
                if acc { Ok(true) } else { has_valid_repr(attr) }
            },
        )?;

    if !has_valid {
        let help_msg = if matches!(input.data, Data::Enum(_)) {
            "Payload requires #[repr(C)], #[repr(transparent)], \
             or #[repr(u8/i8/etc)] for enums\n\
             help: add #[repr(C)] or #[repr(u8)] above this item"
        } else {
            "Payload requires #[repr(C)] or #[repr(transparent)]\n\
             help: add #[repr(C)] above this item"
        };
        return Err(Error::new(input.span(), help_msg));
    }
    Ok(())
}

fn get_field_types(data: &Data) -> syn::Result<Vec<Type>> {
    fn extract_field_types(fields: &Fields) -> Vec<Type> {
        match fields {
            Fields::Named(fields) => fields.named.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unnamed(fields) => fields.unnamed.iter().map(|f| f.ty.clone()).collect(),
            Fields::Unit => Vec::new(),
        }
    }

    match data {
        Data::Struct(data_struct) => Ok(extract_field_types(&data_struct.fields)),

        Data::Enum(data_enum) => Ok(data_enum
            .variants
            .iter()
            .flat_map(|variant| extract_field_types(&variant.fields))
            .collect()),

        Data::Union(u) => Err(Error::new(
            u.union_token.span,
            "Payload cannot be derived for unions",
        )),
    }
}

fn check_types(field_ty: &Type) -> syn::Result<()> {
    // Inner recursive walker that has access to the original field type.
    fn walk(ty: &Type, field_ty: &Type) -> syn::Result<()> {
        match ty {
            Type::Path(TypePath { path, .. }) => {
                for segment in &path.segments {
                    check_forbidden_type(&segment.ident, field_ty, segment.ident.span())?;

                    match &segment.arguments {
                        PathArguments::AngleBracketed(args) => {
                            for arg in &args.args {
                                if let GenericArgument::Type(inner_ty) = arg {
                                    walk(inner_ty, field_ty)?;
                                }
                            }
                        }
                        PathArguments::Parenthesized(args) => {
                            for input in &args.inputs {
                                walk(input, field_ty)?;
                            }
                            if let ReturnType::Type(_, ret_ty) = &args.output {
                                walk(ret_ty, field_ty)?;
                            }
                        }
                        PathArguments::None => {}
                    }
                }
            }

            Type::Reference(type_ref) => {
                return Err(Error::new(
                    type_ref.span(),
                    format!(
                        "Field type `{}` contains a reference (`&` or `&mut`).\n\
                         References cannot travel through a queue that outlives the borrow,\n\
                         and are process-specific in shared memory.\n\
                         help: use inline data instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Ptr(type_ptr) => {
                return Err(Error::new(
                    type_ptr.span(),
                    format!(
                        "Field type `{}` contains a raw pointer (`*const` or `*mut`).\n\
                         Pointers are process-specific and cannot be shared across processes.\n\
                         help: use inline data instead",
                        quote!(#field_ty),
                    ),
                ));
            }

            Type::Tuple(tuple) => {
                for elem in &tuple.elems {
                    walk(elem, field_ty)?;
                }
            }

            Type::Array(array) => {
                walk(&array.elem, field_ty)?;
            }

            Type::Slice(slice) => {
                walk(&slice.elem, field_ty)?;
            }

            Type::Group(group) => {
                walk(&group.elem, field_ty)?;
            }

            Type::Paren(paren) => {
                walk(&paren.elem, field_ty)?;
            }

            // Other variants (Never, Infer, Macro, TraitObject, ImplTrait, Verbatim, etc.)
            // either can't appear as struct fields or don't contain type parameters we care about.
            _ => {}
        }

        Ok(())
    }

    walk(field_ty, field_ty)
}

fn check_forbidden_type(
    ident: &Ident,
    field_ty: &Type,
    span: proc_macro2::Span,
) -> syn::Result<()> {
    enum ForbiddenType {
        Heap,
        RefCounted,
        ProcessLocal,
    }

    fn classify_forbidden(ident: &Ident) -> Option<ForbiddenType> {
        const HEAP_TYPES: &[&str] = &["Vec", "Box", "String", "PathBuf", "OsString", "CString"];
        const RC_TYPES: &[&str] = &["Rc", "Arc"];
        const SYNC_TYPES: &[&str] = &["Mutex", "RwLock", "Condvar", "Barrier"];

        if HEAP_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::Heap)
        } else if RC_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::RefCounted)
        } else if SYNC_TYPES.iter().any(|&name| ident == name) {
            Some(ForbiddenType::ProcessLocal)
        } else {
            None
        }
    }

    if let Some(category) = classify_forbidden(ident) {
        let msg = match category {
            ForbiddenType::Heap => format!(
                "Field type `{}` contains `{}` which has heap allocation.\n\
                 Queue payloads must be plain byte patterns.\n\
                 help: use inline data like `[T; N]` instead of `Vec<T>`, or primitive types",
                quote!(#field_ty),
                ident,
            ),
            ForbiddenType::RefCounted => format!(
                "Field type `{}` contains `{}` which uses reference counting.\n\
                 The queues copy payloads without running destructors, which would\n\
                 corrupt the reference count.\n\
                 help: use inline data instead",
                quote!(#field_ty),
                ident,
            ),
            ForbiddenType::ProcessLocal => format!(
                "Field type `{}` contains `{}` which is process-local and not copyable.\n\
                 help: queue payloads should carry data, not synchronization primitives",
                quote!(#field_ty),
                ident,
            ),
        };

        return Err(Error::new(span, msg));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use syn::parse_quote;

    #[test]
    fn repr_c_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C)]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn repr_transparent_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(transparent)]
            struct Foo(u32);
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn repr_u8_enum_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(u8)]
            enum Foo {
                A,
                B,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn missing_repr_is_rejected() {
        let input: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn repr_c_with_align_is_accepted() {
        let input: DeriveInput = parse_quote! {
            #[repr(C, align(64))]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_ok());
    }

    #[test]
    fn repr_align_alone_is_rejected() {
        let input: DeriveInput = parse_quote! {
            #[repr(align(64))]
            struct Foo {
                x: u32,
            }
        };
        assert!(check_repr(&input).is_err());
    }

    #[test]
    fn primitives_are_accepted() {
        let ty: Type = parse_quote!(u32);
        assert!(check_types(&ty).is_ok());
    }

    #[test]
    fn arrays_are_accepted() {
        let ty: Type = parse_quote!([u8; 32]);
        assert!(check_types(&ty).is_ok());
    }

    #[test]
    fn vec_is_rejected() {
        let ty: Type = parse_quote!(Vec<u8>);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn box_is_rejected() {
        let ty: Type = parse_quote!(Box<u32>);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn string_is_rejected() {
        let ty: Type = parse_quote!(String);
        assert!(check_types(&ty).is_err());
    }

    #[test]
    fn rc_and_arc_are_rejected() {
        let rc: Type = parse_quote!(Rc<u32>);
        assert!(check_types(&rc).is_err());
        let arc: Type = parse_quote!(Arc<u32>);
        assert!(check_types(&arc).is_err());
    }

    #[test]
    fn references_are_rejected() {
        let shared: Type = parse_quote!(&u32);
        assert!(check_types(&shared).is_err());
        let unique: Type = parse_quote!(&mut u32);
        assert!(check_types(&unique).is_err());
    }

    #[test]
    fn raw_pointers_are_rejected() {
        let const_ptr: Type = parse_quote!(*const u32);
        assert!(check_types(&const_ptr).is_err());
        let mut_ptr: Type = parse_quote!(*mut u32);
        assert!(check_types(&mut_ptr).is_err());
    }

    #[test]
    fn sync_primitives_are_rejected() {
        let mutex: Type = parse_quote!(Mutex<u32>);
        assert!(check_types(&mutex).is_err());
        let rwlock: Type = parse_quote!(RwLock<u32>);
        assert!(check_types(&rwlock).is_err());
        let condvar: Type = parse_quote!(Condvar);
        assert!(check_types(&condvar).is_err());
    }

    #[test]
    fn nested_forbidden_types_are_found() {
        let in_option: Type = parse_quote!(Option<Vec<u8>>);
        assert!(check_types(&in_option).is_err());
        let in_tuple: Type = parse_quote!((u32, Box<u64>));
        assert!(check_types(&in_tuple).is_err());
        let in_array: Type = parse_quote!([Mutex<u64>; 4]);
        assert!(check_types(&in_array).is_err());
        let in_result: Type = parse_quote!(Result<Arc<u32>, String>);
        assert!(check_types(&in_result).is_err());
    }

    #[test]
    fn nested_clean_types_are_accepted() {
        let in_option: Type = parse_quote!(Option<u32>);
        assert!(check_types(&in_option).is_ok());
        let in_result: Type = parse_quote!(Result<u32, i32>);
        assert!(check_types(&in_result).is_ok());
    }

    #[test]
    fn field_types_from_struct() {
        let input: DeriveInput = parse_quote! {
            struct Foo {
                x: u32,
                y: u64,
            }
        };
        let types = get_field_types(&input.data).unwrap();
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn field_types_from_tuple_struct() {
        let input: DeriveInput = parse_quote! {
            struct Foo(u32, u64);
        };
        let types = get_field_types(&input.data).unwrap();
        assert_eq!(types.len(), 2);
    }

    #[test]
    fn field_types_from_enum() {
        let input: DeriveInput = parse_quote! {
            enum Foo {
                A(u32),
                B { x: u64 },
                C,
            }
        };
        let types = get_field_types(&input.data).unwrap();
        assert_eq!(types.len(), 2); // u32 and u64
    }

    #[test]
    fn unions_are_rejected() {
        let input: DeriveInput = parse_quote! {
            union Foo {
                x: u32,
                y: f32,
            }
        };
        assert!(get_field_types(&input.data).is_err());
    }
}
