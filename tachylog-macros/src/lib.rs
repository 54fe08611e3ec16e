//! `#[derive(Codec)]` for user-defined log arguments.
//!
//! Members are encoded in declaration order. On the backend the value is
//! rebuilt from the queue bytes and rendered through its `Display` impl, or its
//! `Debug` impl with `#[codec(debug)]`.
//!
//! ```rust,ignore
//! #[derive(tachylog::Codec, Debug)]
//! #[codec(debug)]
//! struct Fill {
//!   order_id: u64,
//!   venue: String,
//! }
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::{format_ident, quote};
use syn::{parse_macro_input, Data, DeriveInput, Fields};

#[proc_macro_derive(Codec, attributes(codec))]
pub fn derive_codec(input: TokenStream) -> TokenStream {
  let ast = parse_macro_input!(input as DeriveInput);
  impl_codec(&ast).unwrap_or_else(syn::Error::into_compile_error).into()
}

fn impl_codec(ast: &DeriveInput) -> syn::Result<TokenStream2> {
  let name = &ast.ident;

  if !ast.generics.params.is_empty() {
    return Err(syn::Error::new_spanned(
      &ast.generics,
      "#[derive(Codec)] does not support generic types",
    ));
  }

  let use_debug = wants_debug(ast)?;

  let Data::Struct(data) = &ast.data else {
    return Err(syn::Error::new_spanned(
      name,
      "#[derive(Codec)] is only supported on structs",
    ));
  };

  // Member accessors for encoding and the constructor for decoding
  let (members, constructor) = match &data.fields {
    Fields::Named(fields) => {
      let idents: Vec<_> = fields.named.iter().filter_map(|f| f.ident.clone()).collect();
      let types: Vec<_> = fields.named.iter().map(|f| &f.ty).collect();
      let members: Vec<TokenStream2> = idents.iter().map(|ident| quote!(#ident)).collect();
      let constructor = quote! {
        Self {
          #(#idents: <#types as ::tachylog::codec::Decode>::decode(decoder)?,)*
        }
      };
      (members, constructor)
    },
    Fields::Unnamed(fields) => {
      let types: Vec<_> = fields.unnamed.iter().map(|f| &f.ty).collect();
      let members: Vec<TokenStream2> = (0..types.len())
        .map(|index| {
          let index = syn::Index::from(index);
          quote!(#index)
        })
        .collect();
      let constructor = quote! {
        Self(#(<#types as ::tachylog::codec::Decode>::decode(decoder)?,)*)
      };
      (members, constructor)
    },
    Fields::Unit => (Vec::new(), quote!(Self)),
  };

  let wrap = if use_debug {
    format_ident!("debug")
  } else {
    format_ident!("display")
  };

  Ok(quote! {
    impl ::tachylog::codec::Codec for #name {
      type Signature = Self;

      #[inline]
      fn encoded_size(&self) -> usize {
        0 #(+ ::tachylog::codec::Codec::encoded_size(&self.#members))*
      }

      #[inline]
      fn encode(&self, encoder: &mut ::tachylog::codec::Encoder<'_>) {
        #(::tachylog::codec::Codec::encode(&self.#members, encoder);)*
      }

      fn decode_arg<'a>(
        decoder: &mut ::tachylog::codec::Decoder<'a>,
      ) -> ::tachylog::error::Result<::tachylog::codec::Arg<'a>> {
        ::core::result::Result::Ok(::tachylog::codec::Arg::#wrap(
          <Self as ::tachylog::codec::Decode>::decode(decoder)?,
        ))
      }
    }

    impl ::tachylog::codec::Decode for #name {
      #[allow(unused_variables)]
      fn decode(decoder: &mut ::tachylog::codec::Decoder<'_>) -> ::tachylog::error::Result<Self> {
        ::core::result::Result::Ok(#constructor)
      }
    }
  })
}

/// `#[codec(debug)]` selects `Debug` rendering.
fn wants_debug(ast: &DeriveInput) -> syn::Result<bool> {
  let mut debug = false;
  for attr in ast.attrs.iter().filter(|a| a.path().is_ident("codec")) {
    attr.parse_nested_meta(|meta| {
      if meta.path.is_ident("debug") {
        debug = true;
        Ok(())
      } else {
        Err(meta.error("unsupported codec attribute, expected `debug`"))
      }
    })?;
  }
  Ok(debug)
}
