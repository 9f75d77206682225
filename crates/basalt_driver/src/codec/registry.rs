//! Codec resolution with caching and stable precedence.
//!
//! Lookup order: cache hit, then a linear scan over registered codecs
//! (built-ins first, user codecs in registration order), then on-the-fly
//! synthesis for collections, tuples, UDTs and custom types. Value-based
//! lookups are never cached because `accepts_value` is a runtime shape test.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use basalt_proto::types::CqlType;
use lru::LruCache;
use tracing::{trace, warn};

use super::{collections, primitives, CodecRef, CqlValue, RustType};
use crate::errors::CodecError;

type CacheKey = (CqlType, Option<RustType>);

/// Total cache weight bound; composition weights are small, so this
/// comfortably holds every shallow combination while bounding pathological
/// deeply-nested synthesis.
const DEFAULT_MAX_CACHE_WEIGHT: usize = 1000;

/// Weight of a codec cache entry, by wire-type composition depth.
///
/// Registered codecs and primitives weigh 0; collections weigh the sum of
/// their inner weights plus their nesting level; UDTs and tuples weigh the
/// same but never less than 1; custom types weigh 1. Weight-0 entries are
/// pinned, so shallow codecs are never evicted.
pub(crate) fn weight_of(ty: &CqlType) -> usize {
    fn weigh(ty: &CqlType, level: usize) -> usize {
        match ty {
            CqlType::List(elem) | CqlType::Set(elem) => level + weigh(elem, level + 1),
            CqlType::Map(key, value) => level + weigh(key, level + 1) + weigh(value, level + 1),
            CqlType::Tuple(elems) => {
                let weight = level
                    + elems
                        .iter()
                        .map(|elem| weigh(elem, level + 1))
                        .sum::<usize>();
                weight.max(1)
            }
            CqlType::Udt(udt) => {
                let weight = level
                    + udt
                        .fields
                        .iter()
                        .map(|(_, field)| weigh(field, level + 1))
                        .sum::<usize>();
                weight.max(1)
            }
            CqlType::Custom(_) => 1,
            _ => 0,
        }
    }
    weigh(ty, 0)
}

struct CodecCache {
    /// Weight-0 entries; never evicted.
    pinned: HashMap<CacheKey, CodecRef>,
    /// Weighted entries, evicted least-recently-used once the total weight
    /// exceeds the bound.
    weighted: LruCache<CacheKey, (CodecRef, usize)>,
    total_weight: usize,
    max_weight: usize,
}

impl CodecCache {
    fn new(max_weight: usize) -> Self {
        CodecCache {
            pinned: HashMap::new(),
            weighted: LruCache::unbounded(),
            total_weight: 0,
            max_weight,
        }
    }

    fn get(&mut self, key: &CacheKey) -> Option<CodecRef> {
        if let Some(codec) = self.pinned.get(key) {
            return Some(codec.clone());
        }
        self.weighted.get(key).map(|(codec, _)| codec.clone())
    }

    fn insert(&mut self, key: CacheKey, codec: CodecRef, weight: usize) {
        if weight == 0 {
            self.pinned.insert(key, codec);
            return;
        }
        if let Some((_, old_weight)) = self.weighted.push(key, (codec, weight)) {
            // push returns the displaced entry when the key already existed.
            self.total_weight = self.total_weight.saturating_sub(old_weight.1);
        }
        self.total_weight += weight;
        while self.total_weight > self.max_weight {
            match self.weighted.pop_lru() {
                Some((evicted_key, (_, evicted_weight))) => {
                    trace!(key = ?evicted_key, weight = evicted_weight, "evicting codec from cache");
                    self.total_weight = self.total_weight.saturating_sub(evicted_weight);
                }
                None => break,
            }
        }
    }
}

/// A registry of codecs shared by every session bound to one cluster handle.
///
/// The registry is initialized with built-in codecs for all native types;
/// user codecs are appended in registration order. All operations are
/// thread-safe; registering codecs at startup and treating the registry as
/// immutable afterwards is recommended.
pub struct CodecRegistry {
    codecs: RwLock<Vec<CodecRef>>,
    cache: Mutex<CodecCache>,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CodecRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let codecs = self.codecs.read().expect("codec list lock");
        f.debug_struct("CodecRegistry")
            .field("codecs", &codecs.len())
            .finish()
    }
}

impl CodecRegistry {
    /// A registry with the built-in codecs and the default cache bound.
    pub fn new() -> Self {
        Self::with_max_cache_weight(DEFAULT_MAX_CACHE_WEIGHT)
    }

    pub fn with_max_cache_weight(max_weight: usize) -> Self {
        CodecRegistry {
            codecs: RwLock::new(primitives::default_codecs()),
            cache: Mutex::new(CodecCache::new(max_weight)),
        }
    }

    /// Register a codec. Chainable; logs a warning and ignores the codec if
    /// it collides with an already-accepted mapping.
    ///
    /// The collision check is best-effort: under concurrent registration the
    /// worst outcome is a missing warning and a codec that is never reached.
    pub fn register(&self, codec: CodecRef) -> &Self {
        {
            let mut codecs = self.codecs.write().expect("codec list lock");
            for existing in codecs.iter() {
                if existing.accepts_cql(codec.cql_type())
                    && existing.accepts_rust(codec.rust_type())
                {
                    warn!(
                        new = %codec.cql_type(),
                        existing = %existing.cql_type(),
                        "ignoring codec: it collides with a previously registered codec"
                    );
                    return self;
                }
            }
            let key = (
                codec.cql_type().clone(),
                Some(codec.rust_type().clone()),
            );
            if self.cache.lock().expect("codec cache lock").get(&key).is_some() {
                warn!(
                    new = %codec.cql_type(),
                    "ignoring codec: it collides with a previously generated codec"
                );
                return self;
            }
            codecs.push(codec);
        }
        self
    }

    /// First codec accepting the wire type; synthesized if none is
    /// registered. Results are cached.
    pub fn codec_for(&self, cql: &CqlType) -> Result<CodecRef, CodecError> {
        self.lookup(cql, None)
    }

    /// Deterministic codec for a `(wire type, driver type)` pair. Results are
    /// cached.
    pub fn codec_for_rust(
        &self,
        cql: &CqlType,
        rust: &RustType,
    ) -> Result<CodecRef, CodecError> {
        self.lookup(cql, Some(rust))
    }

    /// First codec accepting the value's runtime shape. Never cached.
    pub fn codec_for_value(&self, value: &CqlValue) -> Result<CodecRef, CodecError> {
        self.find_by_value(None, value)
    }

    /// Codec jointly accepting the wire type and the value. Never cached.
    pub fn codec_for_cql_value(
        &self,
        cql: &CqlType,
        value: &CqlValue,
    ) -> Result<CodecRef, CodecError> {
        self.find_by_value(Some(cql), value)
    }

    fn lookup(&self, cql: &CqlType, rust: Option<&RustType>) -> Result<CodecRef, CodecError> {
        let key = (cql.clone(), rust.cloned());
        if let Some(codec) = self.cache.lock().expect("codec cache lock").get(&key) {
            trace!(cql = %cql, "codec cache hit");
            return Ok(codec);
        }
        let codec = self.find_codec(cql, rust)?;
        let weight = if self.is_registered(&codec) {
            0
        } else {
            weight_of(cql)
        };
        self.cache
            .lock()
            .expect("codec cache lock")
            .insert(key, codec.clone(), weight);
        Ok(codec)
    }

    fn is_registered(&self, codec: &CodecRef) -> bool {
        self.codecs
            .read()
            .expect("codec list lock")
            .iter()
            .any(|registered| Arc::ptr_eq(registered, codec))
    }

    fn find_codec(
        &self,
        cql: &CqlType,
        rust: Option<&RustType>,
    ) -> Result<CodecRef, CodecError> {
        {
            let codecs = self.codecs.read().expect("codec list lock");
            for codec in codecs.iter() {
                if codec.accepts_cql(cql) && rust.map_or(true, |r| codec.accepts_rust(r)) {
                    return Ok(codec.clone());
                }
            }
        }
        let codec = self
            .maybe_create(cql, rust)?
            .ok_or_else(|| not_found(cql, rust))?;
        // The created codec may not satisfy the original request: if only a
        // codec for A is registered, a lookup for list<B> synthesizes
        // list<A>, which must be rejected here.
        if !codec.accepts_cql(cql) || !rust.map_or(true, |r| codec.accepts_rust(r)) {
            return Err(not_found(cql, rust));
        }
        trace!(cql = %cql, "codec created");
        Ok(codec)
    }

    fn maybe_create(
        &self,
        cql: &CqlType,
        rust: Option<&RustType>,
    ) -> Result<Option<CodecRef>, CodecError> {
        Ok(match (cql, rust) {
            (CqlType::List(elem_cql), None) => {
                Some(collections::list(self.find_codec(elem_cql, None)?))
            }
            (CqlType::List(elem_cql), Some(RustType::List(elem_rust))) => {
                Some(collections::list(self.find_codec(elem_cql, Some(elem_rust))?))
            }
            (CqlType::Set(elem_cql), None) => {
                Some(collections::set(self.find_codec(elem_cql, None)?))
            }
            (CqlType::Set(elem_cql), Some(RustType::Set(elem_rust))) => {
                Some(collections::set(self.find_codec(elem_cql, Some(elem_rust))?))
            }
            (CqlType::Map(key_cql, value_cql), None) => Some(collections::map(
                self.find_codec(key_cql, None)?,
                self.find_codec(value_cql, None)?,
            )),
            (CqlType::Map(key_cql, value_cql), Some(RustType::Map(key_rust, value_rust))) => {
                Some(collections::map(
                    self.find_codec(key_cql, Some(key_rust))?,
                    self.find_codec(value_cql, Some(value_rust))?,
                ))
            }
            (CqlType::Tuple(elems), None) | (CqlType::Tuple(elems), Some(RustType::Tuple)) => {
                let mut codecs = Vec::with_capacity(elems.len());
                for elem in elems {
                    codecs.push(self.find_codec(elem, None)?);
                }
                Some(collections::tuple(elems.clone(), codecs))
            }
            (CqlType::Udt(udt), None) | (CqlType::Udt(udt), Some(RustType::Udt)) => {
                let mut codecs = Vec::with_capacity(udt.fields.len());
                for (_, field) in &udt.fields {
                    codecs.push(self.find_codec(field, None)?);
                }
                Some(collections::udt(udt.clone(), codecs))
            }
            (CqlType::Custom(class), None) | (CqlType::Custom(class), Some(RustType::Bytes)) => {
                Some(collections::custom(class.clone()))
            }
            _ => None,
        })
    }

    fn find_by_value(
        &self,
        cql: Option<&CqlType>,
        value: &CqlValue,
    ) -> Result<CodecRef, CodecError> {
        {
            let codecs = self.codecs.read().expect("codec list lock");
            for codec in codecs.iter() {
                if cql.map_or(true, |t| codec.accepts_cql(t)) && codec.accepts_value(value) {
                    return Ok(codec.clone());
                }
            }
        }
        let codec = self
            .maybe_create_for_value(cql, value)?
            .ok_or_else(|| not_found_value(cql, value))?;
        if !cql.map_or(true, |t| codec.accepts_cql(t)) || !codec.accepts_value(value) {
            return Err(not_found_value(cql, value));
        }
        Ok(codec)
    }

    fn maybe_create_for_value(
        &self,
        cql: Option<&CqlType>,
        value: &CqlValue,
    ) -> Result<Option<CodecRef>, CodecError> {
        fn elem_of(cql: Option<&CqlType>) -> Option<&CqlType> {
            match cql {
                Some(CqlType::List(elem)) | Some(CqlType::Set(elem)) => Some(elem),
                _ => None,
            }
        }

        Ok(match value {
            CqlValue::List(items) if matches!(cql, None | Some(CqlType::List(_))) => {
                let elem = match items.first() {
                    // With no element and no declared type, fall back to blob.
                    None => self.find_codec(elem_of(cql).unwrap_or(&CqlType::Blob), None)?,
                    Some(first) => self.find_by_value(elem_of(cql), first)?,
                };
                Some(collections::list(elem))
            }
            CqlValue::Set(items) if matches!(cql, None | Some(CqlType::Set(_))) => {
                let elem = match items.first() {
                    None => self.find_codec(elem_of(cql).unwrap_or(&CqlType::Blob), None)?,
                    Some(first) => self.find_by_value(elem_of(cql), first)?,
                };
                Some(collections::set(elem))
            }
            CqlValue::Map(entries) if matches!(cql, None | Some(CqlType::Map(_, _))) => {
                let (key_cql, value_cql) = match cql {
                    Some(CqlType::Map(key, value)) => (Some(&**key), Some(&**value)),
                    _ => (None, None),
                };
                let (key_codec, value_codec) = match entries.first() {
                    None => (
                        self.find_codec(key_cql.unwrap_or(&CqlType::Blob), None)?,
                        self.find_codec(value_cql.unwrap_or(&CqlType::Blob), None)?,
                    ),
                    Some((first_key, first_value)) => (
                        self.find_by_value(key_cql, first_key)?,
                        self.find_by_value(value_cql, first_value)?,
                    ),
                };
                Some(collections::map(key_codec, value_codec))
            }
            // Dynamic tuple and UDT values do not carry a full wire
            // descriptor, so they resolve only when one is supplied.
            CqlValue::Tuple(_) => match cql {
                Some(ty @ CqlType::Tuple(_)) => self.maybe_create(ty, None)?,
                _ => None,
            },
            CqlValue::Udt { .. } => match cql {
                Some(ty @ CqlType::Udt(_)) => self.maybe_create(ty, None)?,
                _ => None,
            },
            CqlValue::Custom { class, .. } => match cql {
                Some(ty @ CqlType::Custom(declared)) if declared == class => {
                    self.maybe_create(ty, None)?
                }
                None => Some(collections::custom(class.clone())),
                _ => None,
            },
            _ => None,
        })
    }
}

fn not_found(cql: &CqlType, rust: Option<&RustType>) -> CodecError {
    CodecError::NotFound {
        cql: cql.to_string(),
        rust: rust.map_or_else(|| "ANY".to_string(), |r| r.to_string()),
    }
}

fn not_found_value(cql: Option<&CqlType>, value: &CqlValue) -> CodecError {
    CodecError::NotFound {
        cql: cql.map_or_else(|| "ANY".to_string(), |t| t.to_string()),
        rust: format!("value of shape {}", value.kind()),
    }
}

#[cfg(test)]
mod tests {
    use super::super::{primitives, Codec};
    use super::*;
    use basalt_proto::ProtocolVersion;
    use bytes::Bytes;

    /// Test stand-in for a user codec mapping `timestamp` to a civil date
    /// type, the classic custom-codec example.
    #[derive(Debug)]
    struct LocalDateCodec {
        cql: CqlType,
        rust: RustType,
    }

    fn local_date_codec() -> CodecRef {
        Arc::new(LocalDateCodec {
            cql: CqlType::Timestamp,
            rust: RustType::named("LocalDate"),
        })
    }

    impl Codec for LocalDateCodec {
        fn cql_type(&self) -> &CqlType {
            &self.cql
        }

        fn rust_type(&self) -> &RustType {
            &self.rust
        }

        fn accepts_value(&self, value: &CqlValue) -> bool {
            matches!(value, CqlValue::Date(_))
        }

        fn serialize(
            &self,
            value: &CqlValue,
            _: ProtocolVersion,
        ) -> Result<Bytes, CodecError> {
            match value {
                CqlValue::Date(days) => {
                    Ok(Bytes::copy_from_slice(&(u64::from(*days)).to_be_bytes()))
                }
                other => Err(super::super::mismatch(self, other)),
            }
        }

        fn deserialize(
            &self,
            bytes: &[u8],
            _: ProtocolVersion,
        ) -> Result<CqlValue, CodecError> {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(bytes);
            Ok(CqlValue::Date(u64::from_be_bytes(arr) as u32))
        }

        fn format(&self, _: &CqlValue) -> Result<String, CodecError> {
            Ok("'1970-01-01'".into())
        }

        fn parse(&self, _: &str) -> Result<CqlValue, CodecError> {
            Ok(CqlValue::Date(0))
        }
    }

    #[test]
    fn wire_only_lookup_returns_first_registered_match() {
        let registry = CodecRegistry::new();
        // varchar is declared before ascii; both accept text cells on the
        // wire only via their own type, so each resolves to itself.
        let codec = registry.codec_for(&CqlType::Varchar).unwrap();
        assert_eq!(codec.cql_type(), &CqlType::Varchar);
        let codec = registry.codec_for(&CqlType::Ascii).unwrap();
        assert_eq!(codec.cql_type(), &CqlType::Ascii);
    }

    #[test]
    fn registration_precedence_first_wins() {
        let registry = CodecRegistry::new();
        let first = local_date_codec();
        registry.register(first.clone());
        // A second codec for the same mapping collides and is ignored.
        registry.register(local_date_codec());
        let resolved = registry
            .codec_for_rust(&CqlType::Timestamp, &RustType::named("LocalDate"))
            .unwrap();
        assert!(Arc::ptr_eq(&resolved, &first));
    }

    #[test]
    fn list_codec_is_synthesized_from_registered_element_codec() {
        let registry = CodecRegistry::new();
        registry.register(local_date_codec());

        let list_cql = CqlType::list(CqlType::Timestamp);
        let list_rust = RustType::list(RustType::named("LocalDate"));
        let synthesized = registry.codec_for_rust(&list_cql, &list_rust).unwrap();
        assert_eq!(synthesized.cql_type(), &list_cql);
        assert_eq!(synthesized.rust_type(), &list_rust);

        // Second lookup is served from the cache.
        let cached = registry.codec_for_rust(&list_cql, &list_rust).unwrap();
        assert!(Arc::ptr_eq(&synthesized, &cached));
    }

    #[test]
    fn synthesis_matches_manual_composition() {
        let registry = CodecRegistry::new();
        let via_registry = registry
            .codec_for_rust(
                &CqlType::list(CqlType::Int),
                &RustType::list(RustType::I32),
            )
            .unwrap();
        let manual = collections::list(primitives::int());
        assert_eq!(via_registry.cql_type(), manual.cql_type());
        assert_eq!(via_registry.rust_type(), manual.rust_type());
    }

    #[test]
    fn mismatched_element_type_is_not_found() {
        let registry = CodecRegistry::new();
        // Only int is registered for i32: list<varchar> <-> List<i32> must
        // fail the post-synthesis verification, not silently resolve.
        let err = registry
            .codec_for_rust(
                &CqlType::list(CqlType::Varchar),
                &RustType::list(RustType::I32),
            )
            .unwrap_err();
        assert!(matches!(err, CodecError::NotFound { .. }));
    }

    #[test]
    fn weights_grow_with_nesting_depth() {
        let int = CqlType::Int;
        let list = CqlType::list(int.clone());
        let list_list = CqlType::list(list.clone());
        let list_list_list = CqlType::list(list_list.clone());
        assert!(weight_of(&int) <= weight_of(&list));
        assert!(weight_of(&list) <= weight_of(&list_list));
        assert!(weight_of(&list_list) < weight_of(&list_list_list));
        assert_eq!(weight_of(&list), 0);
        assert_eq!(weight_of(&CqlType::Custom("x".into())), 1);
        // Tuples and UDTs weigh at least 1.
        assert_eq!(weight_of(&CqlType::Tuple(vec![CqlType::Int])), 1);
    }

    #[test]
    fn value_lookup_resolves_by_runtime_shape() {
        let registry = CodecRegistry::new();
        let codec = registry
            .codec_for_value(&CqlValue::List(vec![CqlValue::Int(1)]))
            .unwrap();
        assert_eq!(codec.cql_type(), &CqlType::list(CqlType::Int));
    }

    #[test]
    fn empty_collection_falls_back_to_blob_elements() {
        let registry = CodecRegistry::new();
        let codec = registry.codec_for_value(&CqlValue::List(vec![])).unwrap();
        assert_eq!(codec.cql_type(), &CqlType::list(CqlType::Blob));
        let codec = registry
            .codec_for_value(&CqlValue::Map(vec![]))
            .unwrap();
        assert_eq!(
            codec.cql_type(),
            &CqlType::map(CqlType::Blob, CqlType::Blob)
        );
        // With a declared wire type, its element type wins over blob.
        let codec = registry
            .codec_for_cql_value(&CqlType::set(CqlType::Int), &CqlValue::Set(vec![]))
            .unwrap();
        assert_eq!(codec.cql_type(), &CqlType::set(CqlType::Int));
    }

    #[test]
    fn deep_synthetic_codecs_are_evicted_before_shallow_ones() {
        let registry = CodecRegistry::with_max_cache_weight(3);
        let shallow = CqlType::list(CqlType::Int);
        let shallow_codec = registry.codec_for(&shallow).unwrap();

        // Each of these weighs >= 1; together they exceed the bound.
        for i in 0..8 {
            let deep = CqlType::list(CqlType::list(CqlType::Tuple(vec![
                CqlType::Int;
                (i % 3) + 1
            ])));
            registry.codec_for(&deep).unwrap();
        }

        // The shallow codec weighed 0 and is pinned.
        let again = registry.codec_for(&shallow).unwrap();
        assert!(Arc::ptr_eq(&shallow_codec, &again));
    }

    #[test]
    fn custom_type_resolves_to_pass_through() {
        let registry = CodecRegistry::new();
        let ty = CqlType::Custom("org.example.Marker".into());
        let codec = registry.codec_for(&ty).unwrap();
        let cell = codec
            .deserialize(&[1, 2, 3], ProtocolVersion::V4)
            .unwrap();
        assert!(codec.accepts_value(&cell));
    }

    #[test]
    fn value_lookups_are_not_cached() {
        let registry = CodecRegistry::new();
        let first = registry
            .codec_for_value(&CqlValue::List(vec![CqlValue::Int(1)]))
            .unwrap();
        let second = registry
            .codec_for_value(&CqlValue::List(vec![CqlValue::Int(2)]))
            .unwrap();
        // Freshly synthesized each time.
        assert!(!Arc::ptr_eq(&first, &second));
    }
}
