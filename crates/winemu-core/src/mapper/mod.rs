//! PE32+ module mapper.
//!
//! A mapping call parses and validates an untrusted image, reserves its
//! regions, applies base relocations, resolves imports (mapping dependencies
//! recursively) and finally copies the finished image into the address space.
//! Any rejection releases every region allocated during the call, including
//! those of dependencies, and restores the module table.

mod error;
mod exports;
mod headers;
mod image;
mod imports;
mod reloc;
mod view;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use error::MapError;
pub use headers::{MACHINE_AMD64, MAX_IMAGE_SIZE, PE32_PLUS_MAGIC};
pub use image::{
    ExportTable, ExportTarget, ImportBinding, ImportSymbol, MappedBinary, ModuleTable, Section,
};
pub use reloc::{REL_BASED_ABSOLUTE, REL_BASED_DIR64, REL_BASED_HIGHLOW};

use crate::logger::Logger;
use crate::memory::{
    AddressSpace, Permissions, ADDRESS_LIMIT, ALLOCATION_FLOOR, ALLOCATION_GRANULARITY,
};
use headers::ImageHeaders;

/// Maximum number of forwarder hops followed for one import.
pub const MAX_FORWARDER_DEPTH: u8 = 8;

/// Dependency search configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub struct MapperConfig {
    /// Directories searched, in order, after the importing image's own
    /// directory.
    pub search_paths: Vec<PathBuf>,
}

/// Maps images and their dependencies into an address space.
#[derive(Debug, Clone, Copy)]
pub struct ModuleMapper<'a> {
    config: &'a MapperConfig,
    logger: &'a Logger,
}

impl<'a> ModuleMapper<'a> {
    /// Creates a mapper using `config` for dependency search.
    #[must_use]
    pub const fn new(config: &'a MapperConfig, logger: &'a Logger) -> Self {
        Self { config, logger }
    }

    /// Reads `path` and maps it together with its dependencies.
    ///
    /// # Errors
    ///
    /// Returns a [`MapError`]; `space` and `modules` are unchanged on error.
    pub fn map(
        &self,
        space: &mut AddressSpace,
        modules: &mut ModuleTable,
        path: &Path,
    ) -> Result<Arc<MappedBinary>, MapError> {
        let name = file_name(path);
        if let Some(existing) = modules.find(&name) {
            return Ok(Arc::clone(existing));
        }
        let bytes = read_image(path)?;
        self.transact(space, modules, |session| {
            session.map_image(&name, Some(path.to_path_buf()), &bytes)
        })
    }

    /// Maps an in-memory image registered under `name`.
    ///
    /// Dependencies are searched in the configured search paths only.
    ///
    /// # Errors
    ///
    /// Returns a [`MapError`]; `space` and `modules` are unchanged on error.
    pub fn map_bytes(
        &self,
        space: &mut AddressSpace,
        modules: &mut ModuleTable,
        name: &str,
        bytes: &[u8],
    ) -> Result<Arc<MappedBinary>, MapError> {
        if let Some(existing) = modules.find(name) {
            return Ok(Arc::clone(existing));
        }
        self.transact(space, modules, |session| session.map_image(name, None, bytes))
    }

    fn transact(
        &self,
        space: &mut AddressSpace,
        modules: &mut ModuleTable,
        body: impl FnOnce(&mut MapSession<'_, '_>) -> Result<Arc<MappedBinary>, MapError>,
    ) -> Result<Arc<MappedBinary>, MapError> {
        let modules_len = modules.len();
        let mut session = MapSession {
            mapper: *self,
            space,
            modules,
            allocated: Vec::new(),
            pending: Vec::new(),
        };
        match body(&mut session) {
            Ok(binary) => Ok(binary),
            Err(error) => {
                session.rollback(modules_len);
                self.logger.warn(format_args!("mapping rejected: {error}"));
                Err(error)
            }
        }
    }
}

/// Maps `path` into `space` with default configuration and no output.
///
/// # Errors
///
/// Returns a [`MapError`]; `space` is unchanged on error.
pub fn map(space: &mut AddressSpace, path: &Path) -> Result<Arc<MappedBinary>, MapError> {
    let config = MapperConfig::default();
    let logger = Logger::silent();
    ModuleMapper::new(&config, &logger).map(space, &mut ModuleTable::new(), path)
}

/// Module whose exports are known but whose imports are still resolving.
#[derive(Debug)]
struct PendingModule {
    name: String,
    dir: Option<PathBuf>,
    base: u64,
    span: u64,
    exports: Arc<ExportTable>,
}

/// Export source found for a dependency name.
struct Provider {
    name: String,
    dir: Option<PathBuf>,
    base: u64,
    exports: Arc<ExportTable>,
}

struct MapSession<'m, 's> {
    mapper: ModuleMapper<'m>,
    space: &'s mut AddressSpace,
    modules: &'s mut ModuleTable,
    allocated: Vec<u64>,
    pending: Vec<PendingModule>,
}

impl MapSession<'_, '_> {
    fn rollback(&mut self, modules_len: usize) {
        for base in self.allocated.drain(..).rev() {
            if self.space.free(base).is_err() {
                self.mapper
                    .logger
                    .warn(format_args!("rollback found no region at {base:#x}"));
            }
        }
        self.modules.truncate(modules_len);
        self.pending.clear();
    }

    fn map_image(
        &mut self,
        name: &str,
        path: Option<PathBuf>,
        bytes: &[u8],
    ) -> Result<Arc<MappedBinary>, MapError> {
        let logger = self.mapper.logger;
        let headers = ImageHeaders::parse(bytes)?;
        reject_unsupported(&headers)?;

        let entry_point = validate_entry(&headers)?;
        let base = self.choose_base(&headers)?;
        let delta = base.wrapping_sub(headers.image_base);

        let mut image = build_image(&headers, bytes)?;
        reject_tls_callbacks(&headers, &image)?;
        let adjusted = reloc::apply_relocations(&mut image, headers.directories.base_reloc, delta)?;
        if delta != 0 {
            logger.debug(format_args!(
                "{name}: preferred base {:#x} occupied, relocated to {base:#x} ({adjusted} fixups)",
                headers.image_base
            ));
        }
        let exports = Arc::new(exports::parse_exports(&image, headers.directories.export)?);
        let descriptors = imports::parse_imports(&image, headers.directories.import)?;

        let sections = self.reserve_regions(&headers, base)?;

        let dir = path.as_deref().and_then(Path::parent).map(Path::to_path_buf);
        self.pending.push(PendingModule {
            name: name.to_owned(),
            dir: dir.clone(),
            base,
            span: headers.image_span(),
            exports: Arc::clone(&exports),
        });
        let mut bindings = Vec::new();
        for descriptor in &descriptors {
            for entry in &descriptor.entries {
                let resolved =
                    self.resolve(&descriptor.module, &entry.symbol, dir.as_deref(), 0)?;
                view::write_u64(&mut image, entry.iat_rva, resolved, "import address slot")?;
                bindings.push(ImportBinding {
                    module: descriptor.module.clone(),
                    symbol: entry.symbol.clone(),
                    iat_address: base + entry.iat_rva,
                    resolved_address: resolved,
                });
            }
        }
        self.pending.pop();

        self.space.load(base, &image[..region_len(headers.header_span(), &image)])?;
        for section in headers.sections.iter().filter(|section| section.mapped_size > 0) {
            let start = usize::try_from(section.virtual_address).unwrap_or(usize::MAX);
            let len = usize::try_from(section.mapped_size).unwrap_or(usize::MAX);
            let end = start.saturating_add(len);
            let slice = image.get(start..end.min(image.len())).ok_or_else(|| {
                MapError::CorruptSections(format!("section {} outside image", section.name))
            })?;
            self.space.load(base + section.virtual_address, slice)?;
        }

        let binary = Arc::new(MappedBinary {
            name: name.to_owned(),
            path,
            image_base: base,
            preferred_base: headers.image_base,
            size_of_image: headers.size_of_image,
            entry_point: entry_point.map(|rva| base + rva),
            sections,
            imports: bindings,
            exports,
            is_dll: headers.is_dll,
            stack_reserve: headers.stack_reserve,
        });
        self.modules.push(Arc::clone(&binary));
        logger.info(format_args!(
            "mapped {name} at {base:#x} ({:#x} bytes, {} sections, {} imports)",
            headers.size_of_image,
            binary.sections().len(),
            binary.imports().len()
        ));
        Ok(binary)
    }

    /// Image ranges claimed by mapped and in-flight modules. Only headers
    /// and sections are backed by regions, so the tails past the last
    /// section are not visible to the address space.
    fn claimed_spans(&self) -> Vec<(u64, u64)> {
        self.modules
            .iter()
            .map(|module| (module.image_base(), module.size_of_image()))
            .chain(self.pending.iter().map(|pending| (pending.base, pending.span)))
            .collect()
    }

    fn choose_base(&self, headers: &ImageHeaders) -> Result<u64, MapError> {
        let span = headers.image_span();
        let preferred = headers.image_base;
        let claimed = self.claimed_spans();
        let fits = preferred >= ALLOCATION_FLOOR
            && preferred
                .checked_add(span)
                .is_some_and(|end| end <= ADDRESS_LIMIT)
            && self.space.is_free(preferred, span)
            && claimed.iter().all(|&(base, len)| {
                preferred.saturating_add(span) <= base || base.saturating_add(len) <= preferred
            });
        if fits {
            return Ok(preferred);
        }
        if headers.relocs_stripped {
            return Err(MapError::RelocationsStripped {
                preferred_base: preferred,
            });
        }
        let hint = preferred.max(ALLOCATION_GRANULARITY);
        Ok(self.space.find_free_excluding(span, hint, &claimed)?)
    }

    fn reserve_regions(
        &mut self,
        headers: &ImageHeaders,
        base: u64,
    ) -> Result<Vec<Section>, MapError> {
        let header = self
            .space
            .allocate(Some(base), headers.header_span(), Permissions::READ)?;
        self.allocated.push(header.base);

        let mut sections = Vec::with_capacity(headers.sections.len());
        for section in &headers.sections {
            let permissions = section.permissions();
            if section.mapped_size > 0 {
                let region = self.space.allocate(
                    Some(base + section.virtual_address),
                    section.mapped_size,
                    permissions,
                )?;
                self.allocated.push(region.base);
            }
            sections.push(Section {
                name: section.name.clone(),
                virtual_address: base + section.virtual_address,
                virtual_size: section.virtual_size,
                mapped_size: section.mapped_size,
                permissions,
            });
        }
        Ok(sections)
    }

    fn resolve(
        &mut self,
        module: &str,
        symbol: &ImportSymbol,
        importer_dir: Option<&Path>,
        depth: u8,
    ) -> Result<u64, MapError> {
        let unresolved = || MapError::UnresolvedImport {
            module: module.to_owned(),
            symbol: symbol.to_string(),
        };
        let provider = self.provider(module, importer_dir)?.ok_or_else(unresolved)?;
        let target = match symbol {
            ImportSymbol::Name(name) => provider.exports.by_name(name),
            ImportSymbol::Ordinal(ordinal) => provider.exports.by_ordinal(u32::from(*ordinal)),
        };
        match target {
            Some(ExportTarget::Rva(rva)) => Ok(provider.base + u64::from(*rva)),
            Some(ExportTarget::Forwarder(forwarder)) if depth < MAX_FORWARDER_DEPTH => {
                let (next_module, next_symbol) =
                    imports::parse_forwarder(forwarder).ok_or_else(unresolved)?;
                self.mapper.logger.debug(format_args!(
                    "{}!{symbol} forwards to {forwarder}",
                    provider.name
                ));
                self.resolve(&next_module, &next_symbol, provider.dir.as_deref(), depth + 1)
            }
            Some(ExportTarget::Forwarder(_)) | None => Err(unresolved()),
        }
    }

    fn provider(
        &mut self,
        module: &str,
        importer_dir: Option<&Path>,
    ) -> Result<Option<Provider>, MapError> {
        if let Some(mapped) = self.modules.find(module) {
            return Ok(Some(Provider {
                name: mapped.name().to_owned(),
                dir: mapped.path().and_then(Path::parent).map(Path::to_path_buf),
                base: mapped.image_base(),
                exports: Arc::clone(&mapped.exports),
            }));
        }
        if let Some(pending) = self
            .pending
            .iter()
            .find(|pending| pending.name.eq_ignore_ascii_case(module))
        {
            return Ok(Some(Provider {
                name: pending.name.clone(),
                dir: pending.dir.clone(),
                base: pending.base,
                exports: Arc::clone(&pending.exports),
            }));
        }

        let Some(path) = self.locate(module, importer_dir) else {
            self.mapper
                .logger
                .debug(format_args!("dependency {module} not found"));
            return Ok(None);
        };
        self.mapper
            .logger
            .debug(format_args!("loading dependency {module} from {}", path.display()));
        let bytes = read_image(&path)?;
        let mapped = self.map_image(module, Some(path), &bytes)?;
        Ok(Some(Provider {
            name: mapped.name().to_owned(),
            dir: mapped.path().and_then(Path::parent).map(Path::to_path_buf),
            base: mapped.image_base(),
            exports: Arc::clone(&mapped.exports),
        }))
    }

    fn locate(&self, module: &str, importer_dir: Option<&Path>) -> Option<PathBuf> {
        importer_dir
            .into_iter()
            .chain(self.mapper.config.search_paths.iter().map(PathBuf::as_path))
            .map(|dir| dir.join(module))
            .find(|candidate| candidate.is_file())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name().map_or_else(
        || path.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    )
}

fn read_image(path: &Path) -> Result<Vec<u8>, MapError> {
    std::fs::read(path).map_err(|source| MapError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn region_len(span: u64, image: &[u8]) -> usize {
    usize::try_from(span).map_or(image.len(), |span| span.min(image.len()))
}

fn reject_unsupported(headers: &ImageHeaders) -> Result<(), MapError> {
    let dirs = headers.directories;
    if !dirs.delay_import.is_empty() {
        return Err(MapError::UnsupportedFeature("delay-load imports"));
    }
    if !dirs.clr.is_empty() {
        return Err(MapError::UnsupportedFeature("managed (CLR) image"));
    }
    Ok(())
}

/// TLS directories are accepted only without callbacks.
fn reject_tls_callbacks(headers: &ImageHeaders, image: &[u8]) -> Result<(), MapError> {
    let tls = headers.directories.tls;
    if tls.is_empty() {
        return Ok(());
    }
    let callbacks = view::read_u64(image, tls.rva + 24, "TLS directory")?;
    if callbacks == 0 {
        return Ok(());
    }
    let rva = callbacks.checked_sub(headers.image_base).ok_or_else(|| {
        MapError::InvalidFormat("TLS callback array lies outside the image".into())
    })?;
    if view::read_u64(image, rva, "TLS callback array")? != 0 {
        return Err(MapError::UnsupportedFeature("TLS callbacks"));
    }
    Ok(())
}

/// Returns the entry RVA, or `None` for a DLL declaring no entry point.
fn validate_entry(headers: &ImageHeaders) -> Result<Option<u64>, MapError> {
    let rva = headers.entry_rva;
    if rva == 0 && headers.is_dll {
        return Ok(None);
    }
    let executable = headers
        .section_for(rva)
        .is_some_and(|section| section.permissions().contains(Permissions::EXECUTE));
    if executable {
        Ok(Some(rva))
    } else {
        Err(MapError::InvalidEntryPoint {
            address: headers.image_base.wrapping_add(rva),
        })
    }
}

/// Lays headers and raw section data out at their RVAs.
fn build_image(headers: &ImageHeaders, bytes: &[u8]) -> Result<Vec<u8>, MapError> {
    let span = usize::try_from(headers.image_span())
        .map_err(|_| MapError::InvalidFormat("image too large".into()))?;
    let mut image = vec![0u8; span];

    let header_len = usize::try_from(headers.size_of_headers).unwrap_or(usize::MAX);
    let header_bytes = bytes
        .get(..header_len)
        .ok_or_else(|| MapError::InvalidFormat("headers truncated".into()))?;
    image[..header_len].copy_from_slice(header_bytes);

    for section in &headers.sections {
        let copy = section.raw_size.min(section.mapped_size);
        if copy == 0 {
            continue;
        }
        let (Ok(src), Ok(dst), Ok(len)) = (
            usize::try_from(section.raw_offset),
            usize::try_from(section.virtual_address),
            usize::try_from(copy),
        ) else {
            return Err(MapError::CorruptSections(format!(
                "section {} out of range",
                section.name
            )));
        };
        let source = bytes.get(src..src + len).ok_or_else(|| {
            MapError::CorruptSections(format!("section {} raw data exceeds the file", section.name))
        })?;
        image
            .get_mut(dst..dst + len)
            .ok_or_else(|| {
                MapError::CorruptSections(format!("section {} exceeds the image", section.name))
            })?
            .copy_from_slice(source);
    }
    Ok(image)
}
