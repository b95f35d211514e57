//! Module mapper suite: layout, imports, relocation and rejection atomicity.

#![allow(clippy::pedantic, clippy::nursery, clippy::too_many_lines)]

use std::fs;
use std::path::Path;

use bitflags as _;
use goblin as _;
use iced_x86 as _;
use proptest::prelude::*;
use rstest::rstest;
#[cfg(feature = "serde")]
use serde as _;
use thiserror as _;
use tracing as _;
use widestring as _;
use winemu_core::{
    mapper, AddressSpace, EmulatorConfig, ImportSymbol, Logger, MapError, MapperConfig,
    ModuleMapper, ModuleTable, Permissions, RunRequest, StopReason, WindowsEmulator,
};
use winemu_image::builder::{directory, OPTIONAL_HEADER_OFFSET, REL_DIR64};
use winemu_image::samples::{self, DATA_RVA, EXPORT_RVA, IMPORT_RVA, MATH_LIBRARY, TEXT_RVA};
use winemu_image::{
    ExportItem, ImageBuilder, ImportModule, SectionSpec, DATA, DEFAULT_DLL_BASE, DEFAULT_EXE_BASE,
    TEXT,
};

fn write(dir: &Path, name: &str, bytes: &[u8]) -> std::path::PathBuf {
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

fn map_bytes(
    space: &mut AddressSpace,
    modules: &mut ModuleTable,
    config: &MapperConfig,
    bytes: &[u8],
) -> Result<std::sync::Arc<winemu_core::MappedBinary>, MapError> {
    let logger = Logger::silent();
    ModuleMapper::new(config, &logger).map_bytes(space, modules, "prog.exe", bytes)
}

/// `mov eax, 1; ret` with custom extras applied to the builder.
fn tiny(configure: impl FnOnce(ImageBuilder) -> ImageBuilder) -> Vec<u8> {
    let builder = ImageBuilder::executable().entry(TEXT_RVA).section(SectionSpec::new(
        ".text",
        TEXT_RVA,
        TEXT,
        vec![0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3],
    ));
    configure(builder).build().unwrap()
}

#[test]
fn executable_maps_at_preferred_base_with_section_permissions() {
    let image = samples::global_counter(DEFAULT_EXE_BASE, 3).unwrap();
    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let binary = map_bytes(&mut space, &mut modules, &MapperConfig::default(), &image).unwrap();

    assert_eq!(binary.image_base(), DEFAULT_EXE_BASE);
    assert_eq!(binary.relocation_delta(), 0);
    assert_eq!(binary.entry_point(), Some(DEFAULT_EXE_BASE + 0x1000));
    assert!(!binary.is_dll());
    assert_eq!(modules.len(), 1);

    let header = space.region_at(DEFAULT_EXE_BASE).unwrap();
    assert_eq!(header.permissions, Permissions::READ);
    let text = space.region_at(DEFAULT_EXE_BASE + u64::from(TEXT_RVA)).unwrap();
    assert_eq!(text.permissions, Permissions::READ_EXECUTE);
    let data = space.region_at(DEFAULT_EXE_BASE + u64::from(DATA_RVA)).unwrap();
    assert_eq!(data.permissions, Permissions::READ_WRITE);

    // Headers are readable in place.
    let mut magic = [0u8; 2];
    space.read(DEFAULT_EXE_BASE, &mut magic).unwrap();
    assert_eq!(&magic, b"MZ");
    assert_eq!(
        space.read_u64(DEFAULT_EXE_BASE + u64::from(TEXT_RVA) + 2),
        Ok(DEFAULT_EXE_BASE + u64::from(DATA_RVA))
    );
}

#[test]
fn image_below_the_allocation_floor_is_relocated() {
    let dir = tempfile::tempdir().unwrap();
    let path = write(dir.path(), "counter.exe", &samples::global_counter(0, 3).unwrap());
    let mut space = AddressSpace::new();
    let binary = mapper::map(&mut space, &path).unwrap();

    assert_ne!(binary.image_base(), 0);
    assert_eq!(binary.preferred_base(), 0);
    assert_eq!(binary.path(), Some(path.as_path()));
    assert_eq!(binary.relocation_delta(), binary.image_base() as i64);
    assert_eq!(
        space.read_u64(binary.image_base() + u64::from(TEXT_RVA) + 2),
        Ok(binary.image_base() + u64::from(DATA_RVA))
    );
}

#[test]
fn relocated_image_runs_like_the_original() {
    let config = EmulatorConfig {
        log_output: false,
        ..EmulatorConfig::default()
    };
    for base in [0, DEFAULT_EXE_BASE] {
        let image = samples::global_counter(base, 25).unwrap();
        let mut emulator = WindowsEmulator::from_image_bytes(
            "counter.exe",
            &image,
            config.clone(),
            winemu_core::X64Interpreter::new(),
            winemu_core::NtKernel::default(),
        )
        .unwrap();
        let outcome = emulator.start(RunRequest::new());
        assert_eq!(outcome.stop, StopReason::Terminated(25), "base {base:#x}");
    }
}

#[test]
fn imports_resolve_by_name_forwarder_and_ordinal() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write(dir.path(), "importer.exe", &samples::importer().unwrap());
    write(
        dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_DLL_BASE).unwrap(),
    );

    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let logger = Logger::silent();
    let binary = ModuleMapper::new(&MapperConfig::default(), &logger)
        .map(&mut space, &mut modules, &exe)
        .unwrap();

    assert_eq!(modules.len(), 2);
    let library = modules.find("MATHLIB.DLL").expect("dependency registered");
    assert!(library.is_dll());
    assert_eq!(library.entry_point(), None);
    let add_one = library.export_address("add_one").unwrap();
    let twice = library.export_address("twice").unwrap();

    let bindings = binary.imports();
    assert_eq!(bindings.len(), 3);
    assert_eq!(bindings[0].symbol, ImportSymbol::Name("add_one".into()));
    assert_eq!(bindings[0].resolved_address, add_one);
    assert_eq!(bindings[1].symbol, ImportSymbol::Name("plus_one".into()));
    assert_eq!(bindings[1].resolved_address, add_one);
    assert_eq!(bindings[2].symbol, ImportSymbol::Ordinal(2));
    assert_eq!(bindings[2].resolved_address, twice);
    for binding in bindings {
        assert_eq!(space.read_u64(binding.iat_address), Ok(binding.resolved_address));
    }
    assert_eq!(
        bindings[0].iat_address,
        DEFAULT_EXE_BASE + u64::from(IMPORT_RVA)
    );
}

#[test]
fn colliding_dependency_is_relocated_and_its_data_fixed_up() {
    let dir = tempfile::tempdir().unwrap();
    let exe = write(dir.path(), "importer.exe", &samples::importer().unwrap());
    write(
        dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_EXE_BASE).unwrap(),
    );

    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let logger = Logger::silent();
    ModuleMapper::new(&MapperConfig::default(), &logger)
        .map(&mut space, &mut modules, &exe)
        .unwrap();

    let library = modules.find(MATH_LIBRARY).unwrap();
    assert_eq!(library.preferred_base(), DEFAULT_EXE_BASE);
    assert_ne!(library.image_base(), DEFAULT_EXE_BASE);
    let pointer = library.export_address("add_one_ptr").unwrap();
    assert_eq!(pointer, library.image_base() + u64::from(DATA_RVA));
    assert_eq!(
        space.read_u64(pointer),
        Ok(library.export_address("add_one").unwrap())
    );
    assert_eq!(library.exports().len(), 4);
}

#[test]
fn dependency_is_kept_out_of_the_importer_image_span() {
    const SPAN: u64 = 0x20_0000;
    let mut importer = samples::importer().unwrap();
    let size_of_image = OPTIONAL_HEADER_OFFSET + 56;
    importer[size_of_image..size_of_image + 4].copy_from_slice(&(SPAN as u32).to_le_bytes());

    let dir = tempfile::tempdir().unwrap();
    let exe = write(dir.path(), "importer.exe", &importer);
    write(
        dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_EXE_BASE + 0x10_0000).unwrap(),
    );

    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let logger = Logger::silent();
    let binary = ModuleMapper::new(&MapperConfig::default(), &logger)
        .map(&mut space, &mut modules, &exe)
        .unwrap();
    assert_eq!(binary.image_base(), DEFAULT_EXE_BASE);
    assert_eq!(binary.size_of_image(), SPAN);

    let library = modules.find(MATH_LIBRARY).unwrap();
    assert!(library.image_base() >= DEFAULT_EXE_BASE + SPAN);
    assert_eq!(library.image_base() % 0x1_0000, 0);
    let inside_library = library.export_address("add_one").unwrap();
    assert_eq!(
        modules.containing(inside_library).map(|module| module.name()),
        Some(MATH_LIBRARY)
    );
    assert_eq!(
        modules
            .containing(DEFAULT_EXE_BASE + 0x10_0000)
            .map(|module| module.name()),
        Some("importer.exe")
    );
}

#[test]
fn dependencies_are_found_through_search_paths() {
    let exe_dir = tempfile::tempdir().unwrap();
    let lib_dir = tempfile::tempdir().unwrap();
    let exe = write(exe_dir.path(), "importer.exe", &samples::importer().unwrap());
    write(
        lib_dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_DLL_BASE).unwrap(),
    );

    let without = WindowsEmulator::new(&exe);
    assert!(matches!(
        without,
        Err(winemu_core::EmulatorError::Map(MapError::UnresolvedImport { ref module, .. }))
            if module == MATH_LIBRARY
    ));

    let config = EmulatorConfig {
        mapper: MapperConfig {
            search_paths: vec![lib_dir.path().to_path_buf()],
        },
        log_output: false,
        ..EmulatorConfig::default()
    };
    let mut emulator = WindowsEmulator::with_config(&exe, config).unwrap();
    assert_eq!(emulator.process().modules().len(), 2);
    let outcome = emulator.start(RunRequest::new());
    assert_eq!(outcome.stop, StopReason::Terminated(42));
}

#[test]
fn mapping_the_same_module_twice_reuses_it() {
    let image = samples::return_code(1).unwrap();
    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let config = MapperConfig::default();
    let first = map_bytes(&mut space, &mut modules, &config, &image).unwrap();
    let regions = space.region_count();
    let second = map_bytes(&mut space, &mut modules, &config, &image).unwrap();
    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(space.region_count(), regions);
    assert_eq!(modules.len(), 1);
}

fn overlapping() -> Vec<u8> {
    tiny(|b| b.section(SectionSpec::new(".data", TEXT_RVA, DATA, vec![0; 16])))
}

fn truncated() -> Vec<u8> {
    let mut image = samples::return_code(1).unwrap();
    image.truncate(0x100);
    image
}

fn bad_relocation() -> Vec<u8> {
    tiny(|b| b.relocations(0x5000, vec![(TEXT_RVA, 5)]))
}

fn delay_imports() -> Vec<u8> {
    tiny(|b| {
        b.section(SectionSpec::new(".didat", 0x2000, DATA, vec![0; 64]))
            .directory(directory::DELAY_IMPORT, 0x2000, 32)
    })
}

fn managed() -> Vec<u8> {
    tiny(|b| {
        b.section(SectionSpec::new(".cormeta", 0x2000, DATA, vec![0; 72]))
            .directory(directory::CLR, 0x2000, 72)
    })
}

fn entry_in_data() -> Vec<u8> {
    tiny(|b| {
        b.section(SectionSpec::new(".data", DATA_RVA, DATA, vec![0; 8]))
            .entry(DATA_RVA)
    })
}

/// `.tls` holding an `IMAGE_TLS_DIRECTORY64` whose callback array starts
/// with `first_callback`.
fn with_tls(first_callback: u64) -> Vec<u8> {
    let mut data = vec![0u8; 48];
    data[24..32].copy_from_slice(&(DEFAULT_EXE_BASE + 0x2028).to_le_bytes());
    data[40..48].copy_from_slice(&first_callback.to_le_bytes());
    tiny(|b| {
        b.section(SectionSpec::new(".tls", 0x2000, DATA, data))
            .directory(directory::TLS, 0x2000, 40)
    })
}

fn tls_callbacks() -> Vec<u8> {
    with_tls(DEFAULT_EXE_BASE + u64::from(TEXT_RVA))
}

fn unresolved_symbol() -> Vec<u8> {
    tiny(|b| {
        b.imports(
            IMPORT_RVA,
            vec![ImportModule::by_name(MATH_LIBRARY, &["add_one", "missing"])],
        )
    })
}

#[rstest]
#[case::truncated(truncated(), "InvalidFormat")]
#[case::overlapping_sections(overlapping(), "CorruptSections")]
#[case::bad_relocation_kind(bad_relocation(), "UnsupportedRelocation")]
#[case::delay_imports(delay_imports(), "UnsupportedFeature")]
#[case::managed_image(managed(), "UnsupportedFeature")]
#[case::tls_callbacks(tls_callbacks(), "UnsupportedFeature")]
#[case::entry_outside_code(entry_in_data(), "InvalidEntryPoint")]
#[case::unresolved_symbol(unresolved_symbol(), "UnresolvedImport")]
fn rejected_images_leave_no_trace(#[case] image: Vec<u8>, #[case] expected: &str) {
    let lib_dir = tempfile::tempdir().unwrap();
    write(
        lib_dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_DLL_BASE).unwrap(),
    );
    let config = MapperConfig {
        search_paths: vec![lib_dir.path().to_path_buf()],
    };

    let mut space = AddressSpace::new();
    space.allocate(None, 0x1000, Permissions::READ_WRITE).unwrap();
    let mut modules = ModuleTable::new();
    let before = space.clone();

    let error = map_bytes(&mut space, &mut modules, &config, &image).unwrap_err();
    let variant = format!("{error:?}");
    assert!(
        variant.starts_with(expected),
        "expected {expected}, got {variant}"
    );
    assert_eq!(space, before);
    assert!(modules.is_empty());
}

#[test]
fn tls_without_callbacks_is_accepted() {
    let config = MapperConfig::default();
    let no_callback_array = tiny(|b| {
        b.section(SectionSpec::new(".tls", 0x2000, DATA, vec![0; 40]))
            .directory(directory::TLS, 0x2000, 40)
    });
    for image in [with_tls(0), no_callback_array] {
        let mut space = AddressSpace::new();
        let mut modules = ModuleTable::new();
        let binary = map_bytes(&mut space, &mut modules, &config, &image).unwrap();
        assert_eq!(binary.image_base(), DEFAULT_EXE_BASE);
        assert_eq!(space.region_count(), 3);
    }
}

#[test]
fn tls_callbacks_are_reported_as_unsupported() {
    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();
    let config = MapperConfig::default();
    let error = map_bytes(&mut space, &mut modules, &config, &tls_callbacks()).unwrap_err();
    assert!(matches!(error, MapError::UnsupportedFeature("TLS callbacks")));
    assert_eq!(space.region_count(), 0);
}

#[test]
fn bad_relocation_reports_kind_and_target() {
    let mut space = AddressSpace::new();
    let error = map_bytes(
        &mut space,
        &mut ModuleTable::new(),
        &MapperConfig::default(),
        &bad_relocation(),
    )
    .unwrap_err();
    assert!(matches!(
        error,
        MapError::UnsupportedRelocation { kind: 5, rva } if rva == TEXT_RVA
    ));
}

#[test]
fn stripped_image_cannot_move_off_an_occupied_base() {
    let image = tiny(|b| b.relocs_stripped(true));
    let mut space = AddressSpace::new();
    space
        .allocate(Some(DEFAULT_EXE_BASE), 0x1000, Permissions::READ)
        .unwrap();
    let regions = space.region_count();

    let error = map_bytes(
        &mut space,
        &mut ModuleTable::new(),
        &MapperConfig::default(),
        &image,
    )
    .unwrap_err();
    assert!(matches!(
        error,
        MapError::RelocationsStripped { preferred_base } if preferred_base == DEFAULT_EXE_BASE
    ));
    assert_eq!(space.region_count(), regions);

    // The same image maps once its base is free.
    let mut fresh = AddressSpace::new();
    let binary = map_bytes(
        &mut fresh,
        &mut ModuleTable::new(),
        &MapperConfig::default(),
        &image,
    )
    .unwrap();
    assert_eq!(binary.image_base(), DEFAULT_EXE_BASE);
}

#[test]
fn failed_dependency_chain_unmaps_the_dependency_too() {
    let lib_dir = tempfile::tempdir().unwrap();
    write(
        lib_dir.path(),
        MATH_LIBRARY,
        &samples::math_library(DEFAULT_DLL_BASE).unwrap(),
    );
    let config = MapperConfig {
        search_paths: vec![lib_dir.path().to_path_buf()],
    };
    let mut space = AddressSpace::new();
    let mut modules = ModuleTable::new();

    let error = map_bytes(&mut space, &mut modules, &config, &unresolved_symbol()).unwrap_err();
    assert!(matches!(
        error,
        MapError::UnresolvedImport { ref symbol, .. } if symbol == "missing"
    ));
    assert_eq!(space.region_count(), 0);
    assert!(space.region_at(DEFAULT_DLL_BASE).is_none());
    assert!(modules.find(MATH_LIBRARY).is_none());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut space = AddressSpace::new();
    let error = mapper::map(&mut space, &dir.path().join("absent.exe")).unwrap_err();
    assert!(matches!(error, MapError::Io { .. }));
    assert_eq!(space.region_count(), 0);
}

#[test]
fn data_pointer_export_without_relocation_stays_put() {
    let image = ImageBuilder::dll()
        .image_base(DEFAULT_DLL_BASE)
        .section(SectionSpec::new(".data", DATA_RVA, DATA, 7u64.to_le_bytes().to_vec()))
        .exports(EXPORT_RVA, "value.dll", vec![ExportItem::named("value", DATA_RVA)])
        .relocations(0x5000, vec![(DATA_RVA, REL_DIR64)])
        .build()
        .unwrap();
    let mut space = AddressSpace::new();
    let binary = map_bytes(
        &mut space,
        &mut ModuleTable::new(),
        &MapperConfig::default(),
        &image,
    )
    .unwrap();
    let value = binary.export_address("value").unwrap();
    assert_eq!(space.read_u64(value), Ok(7));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn any_truncation_is_rejected_atomically(keep in 0usize..0x600) {
        let mut image = samples::global_counter(DEFAULT_EXE_BASE, 1).unwrap();
        prop_assume!(keep < image.len());
        image.truncate(keep);

        let mut space = AddressSpace::new();
        let mut modules = ModuleTable::new();
        let result = map_bytes(&mut space, &mut modules, &MapperConfig::default(), &image);
        prop_assert!(result.is_err());
        prop_assert_eq!(space.region_count(), 0);
        prop_assert!(modules.is_empty());
    }

    #[test]
    fn regions_stay_disjoint_across_mappings(
        bases in prop::collection::vec(0u64..8, 1..6)
    ) {
        let mut space = AddressSpace::new();
        let logger = Logger::silent();
        let config = MapperConfig::default();
        let mut modules = ModuleTable::new();
        for (index, slot) in bases.iter().enumerate() {
            let image = samples::global_counter(DEFAULT_EXE_BASE + slot * 0x1_0000, 1).unwrap();
            let name = format!("m{index}.exe");
            let binary = ModuleMapper::new(&config, &logger)
                .map_bytes(&mut space, &mut modules, &name, &image)
                .unwrap();
            let entry = binary.entry_point().unwrap();
            prop_assert!(space
                .region_at(entry)
                .is_some_and(|region| region.permissions.contains(Permissions::EXECUTE)));
        }

        let regions: Vec<_> = space.regions().collect();
        for pair in regions.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].base);
        }
        prop_assert_eq!(modules.len(), bases.len());
    }
}
