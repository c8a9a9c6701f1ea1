use safetensors::{tensor::TensorView, Dtype, SafeTensors};
use std::{collections::HashSet, io, path::Path, path::PathBuf};
use tch::{nn::VarStore, Device, Kind, Tensor};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadSafetensorsError {
    #[error("Failed to open safetensors file: {0}")]
    OpenFile(#[from] io::Error),

    #[error("Failed to deserialize safetensors: {0}")]
    Deserialize(#[from] safetensors::SafeTensorError),

    #[error("failed to perform tensor operation: {0}")]
    TchError(#[from] tch::TchError),

    #[error("Tensor {0} has unsupported dtype {1:?}")]
    UnsupportedDtype(String, Dtype),

    #[error("Checkpoint missing the following variables: {0:?}")]
    MissingVariables(HashSet<String>),
}

fn dtype_to_kind(name: &str, dtype: Dtype) -> Result<Kind, LoadSafetensorsError> {
    match dtype {
        Dtype::BOOL => Ok(Kind::Bool),
        Dtype::U8 => Ok(Kind::Uint8),
        Dtype::I8 => Ok(Kind::Int8),
        Dtype::I16 => Ok(Kind::Int16),
        Dtype::I32 => Ok(Kind::Int),
        Dtype::I64 => Ok(Kind::Int64),
        Dtype::BF16 => Ok(Kind::BFloat16),
        Dtype::F16 => Ok(Kind::Half),
        Dtype::F32 => Ok(Kind::Float),
        Dtype::F64 => Ok(Kind::Double),
        dtype => Err(LoadSafetensorsError::UnsupportedDtype(name.to_owned(), dtype)),
    }
}

/// Borrowing view of a tensor in a memory mapped file. Only valid while the
/// mapping lives, callers copy out of it.
fn borrowed_tensor(name: &str, view: &TensorView<'_>) -> Result<Tensor, LoadSafetensorsError> {
    let size: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
    let kind = dtype_to_kind(name, view.dtype())?;
    Ok(unsafe { Tensor::from_blob(view.data().as_ptr(), &size, &[], kind, Device::Cpu) })
}

fn mmap_file(path: &Path) -> Result<memmap2::Mmap, LoadSafetensorsError> {
    let file = std::fs::File::open(path)?;
    Ok(unsafe { memmap2::MmapOptions::new().map(&file)? })
}

fn is_safetensors(path: &Path) -> bool {
    path.extension()
        .is_some_and(|y| y.eq_ignore_ascii_case("safetensors"))
}

pub fn load_safetensors_into_variables(
    vs: &VarStore,
    repo_files: &[PathBuf],
) -> Result<(), LoadSafetensorsError> {
    let _no_grad = tch::no_grad_guard();
    let mut unmatched = vs.variables().keys().cloned().collect::<HashSet<_>>();
    for path in repo_files.iter().filter(|x| is_safetensors(x)) {
        let content = mmap_file(path)?;
        let safetensors = SafeTensors::deserialize(&content)?;
        for (name, mut var) in vs.variables() {
            if let Ok(view) = safetensors.tensor(&name) {
                var.f_copy_(&borrowed_tensor(&name, &view)?)?;
                unmatched.remove(&name);
            }
        }
    }
    if !unmatched.is_empty() {
        return Err(LoadSafetensorsError::MissingVariables(unmatched));
    }
    Ok(())
}

/// Reads every tensor of the safetensors files in `files` into owned CPU tensors.
pub fn read_safetensors(
    files: &[PathBuf],
) -> Result<Vec<(String, Tensor)>, LoadSafetensorsError> {
    let mut tensors = Vec::new();
    for path in files.iter().filter(|x| is_safetensors(x)) {
        let content = mmap_file(path)?;
        let safetensors = SafeTensors::deserialize(&content)?;
        for (name, view) in safetensors.tensors() {
            let tensor = borrowed_tensor(&name, &view)?.copy();
            tensors.push((name, tensor));
        }
    }
    Ok(tensors)
}
