//! Load driver: open, validate, report, map, hand over.

use std::convert::Infallible;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::io::Write;
use std::os::fd::AsFd;
use std::path::{Path, PathBuf};

use sld_elf::{EM_386, ElfImage, PHDR_SIZE, ProgramHeader, SegmentKind, for_each_segment};
use sld_map::{FileMapping, LoadPlan, LoadedImage, PageSize, SegmentMapper};
use tracing::{debug, debug_span, error, info, warn};

use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::startup::StartupInfo;
use crate::transfer::ControlTransfer;

/// Progress of a single load, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LoadStage {
    Start,
    Opened,
    SizeKnown,
    MetadataMapped,
    Validated,
    HeaderRead,
    SegmentsMapped,
    MetadataUnmapped,
    ControlTransferred,
}

impl fmt::Display for LoadStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Start => "start",
            Self::Opened => "opened",
            Self::SizeKnown => "size known",
            Self::MetadataMapped => "metadata mapped",
            Self::Validated => "validated",
            Self::HeaderRead => "header read",
            Self::SegmentsMapped => "segments mapped",
            Self::MetadataUnmapped => "metadata unmapped",
            Self::ControlTransferred => "control transferred",
        };
        f.write_str(name)
    }
}

/// An image whose segments are in place, ready to be entered.
#[derive(Debug)]
pub struct Prepared {
    pub entry: u32,
    pub startup: StartupInfo,
    pub image: LoadedImage,
}

/// Loads one ELF32 executable into the current process.
#[derive(Debug, Clone)]
pub struct Loader {
    path: PathBuf,
    args: Vec<OsString>,
    env: Vec<OsString>,
}

/// Context threaded through the mapping walk.
struct MapPass<'a, 'r, W: Write> {
    mapper: SegmentMapper<'a>,
    reporter: &'r mut Reporter<W>,
}

impl Loader {
    /// `args` are the image's arguments after its own path.
    pub fn new(path: impl Into<PathBuf>, args: Vec<OsString>) -> Self {
        Self {
            path: path.into(),
            args,
            env: Vec::new(),
        }
    }

    /// Environment strings (`KEY=value`) passed to the image.
    #[must_use]
    pub fn with_env(mut self, env: Vec<OsString>) -> Self {
        self.env = env;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Map the image and build its startup data without entering it.
    ///
    /// # Errors
    ///
    /// Fails on I/O, format and mapping errors. No segment stays mapped when
    /// this returns an error.
    pub fn load<W: Write>(&self, reporter: &mut Reporter<W>) -> Result<Prepared> {
        let _span = debug_span!("load", path = %self.path.display()).entered();

        let file = File::open(&self.path).map_err(|source| Error::Open {
            path: self.path.clone(),
            source,
        })?;
        debug!(stage = %LoadStage::Opened, "opened image");

        let size = file
            .metadata()
            .map_err(|source| Error::FileSize {
                path: self.path.clone(),
                source,
            })?
            .len();
        debug!(stage = %LoadStage::SizeKnown, size, "image size known");

        let metadata = FileMapping::map(&file, size).map_err(|source| Error::MapFile {
            path: self.path.clone(),
            source,
        })?;
        debug!(stage = %LoadStage::MetadataMapped, "metadata mapped");

        let image = ElfImage::parse(metadata.as_bytes())?;
        image.require_fixed_address()?;
        debug!(stage = %LoadStage::Validated, "image validated");

        let header = *image.header();
        if header.machine != EM_386 {
            warn!(machine = header.machine, "image is not built for i386");
        }
        debug!(
            stage = %LoadStage::HeaderRead,
            entry = format_args!("{:#010x}", header.entry),
            phnum = header.phnum,
            "header read"
        );

        reporter.file_info(&header)?;
        for_each_segment(&image.table(), &mut *reporter, |index, phdr, reporter| -> Result<()> {
            warn_unsupported(index, phdr);
            reporter.segment(phdr).map_err(Error::from)
        })?;

        let page = PageSize::host().map_err(Error::Plan)?;
        let plan = LoadPlan::build(&image, page).map_err(Error::Plan)?;
        let phdr = image.phdr_vaddr()?;

        reporter.loading_title()?;
        let mut pass = MapPass {
            mapper: SegmentMapper::new(&plan, file.as_fd()),
            reporter,
        };
        let walked = for_each_segment(&image.table(), &mut pass, |index, phdr, pass| -> Result<()> {
            if pass.mapper.plan_for(index).is_none() {
                return Ok(());
            }
            pass.reporter.loading(phdr)?;
            if let Some(region) = pass.mapper.map_descriptor(index, phdr).map_err(Error::Mapping)? {
                pass.reporter.mapped(&region)?;
            }
            Ok(())
        });
        if let Err(e) = walked {
            pass.mapper.rollback();
            return Err(e);
        }
        let loaded = pass.mapper.finish();
        info!(
            stage = %LoadStage::SegmentsMapped,
            segments = loaded.regions().len(),
            bytes = plan.total_size(),
            "segments mapped"
        );

        let entry = image.entry_point();
        drop(metadata);
        debug!(stage = %LoadStage::MetadataUnmapped, "metadata released");

        let mut args = Vec::with_capacity(self.args.len() + 1);
        args.push(self.path.clone().into_os_string());
        args.extend(self.args.iter().cloned());
        let mut startup = StartupInfo::new(args, entry);
        startup.env = self.env.clone();
        startup.phdr = phdr;
        startup.phent = PHDR_SIZE as u32;
        startup.phnum = u32::from(header.phnum);
        startup.page_size = u32::try_from(plan.page().get()).unwrap_or(0);

        Ok(Prepared {
            entry,
            startup,
            image: loaded,
        })
    }

    /// Load the image and transfer control to it.
    ///
    /// Only returns if something failed, including `transfer` coming back.
    ///
    /// # Errors
    ///
    /// Every outcome is an error; see [`Self::load`] and
    /// [`Error::TransferReturned`].
    pub fn run<W: Write, T: ControlTransfer>(
        &self,
        reporter: &mut Reporter<W>,
        transfer: &mut T,
    ) -> Result<Infallible> {
        let prepared = self.load(reporter)?;
        if let Err(e) = reporter.transfer(prepared.entry) {
            discard(prepared.image);
            return Err(e.into());
        }
        debug!(stage = %LoadStage::ControlTransferred, "entering image");
        let err = transfer.transfer(prepared.entry, &prepared.startup);
        discard(prepared.image);
        Err(err.into())
    }
}

fn warn_unsupported(index: usize, phdr: &ProgramHeader) {
    match phdr.kind {
        SegmentKind::Interp => warn!(index, "image requests an interpreter; it will not be loaded"),
        SegmentKind::Dynamic => warn!(index, "image has dynamic linking information; it is ignored"),
        _ => {}
    }
}

/// Unmap an image that never ran.
fn discard(image: LoadedImage) {
    // SAFETY: control never reached the image.
    if let Err(e) = unsafe { image.unmap() } {
        error!(error = %e, "failed to unmap image");
    }
}
