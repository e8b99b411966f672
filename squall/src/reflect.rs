// SPIR-V reflection
//
// Walks compiled bytecode and recovers the interface a pipeline
// needs: vertex input attributes, descriptor bindings, uniform
// block members with their offsets, and push constant usage. Only
// the small slice of SPIR-V the material system cares about is
// understood; anything outside it fails shader construction.
use crate::image::ImageDim;
use crate::{DataType, DescriptorType, Limits, Result, SquallError};
use spirv_headers as spirv;
use std::collections::HashMap;
use utils::log;

const SPIRV_MAGIC: u32 = 0x0723_0203;

/// One descriptor-visible variable from a single stage
#[derive(Debug, Clone)]
pub(crate) struct ReflectedBinding {
    pub set: u32,
    pub binding: u32,
    pub ty: DescriptorType,
    pub count: u32,
    /// Image dimensionality, meaningful for image descriptors
    pub dim: ImageDim,
    /// The variable's name, used for texture properties
    pub name: String,
    /// Present for uniform blocks
    pub block: Option<ReflectedBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReflectedBlock {
    pub size: u32,
    /// (member name, type, byte offset), in declaration order
    pub members: Vec<(String, DataType, u32)>,
}

#[derive(Debug)]
pub(crate) struct StageReflection {
    /// Vertex attributes by location, vertex stage only
    pub inputs: Vec<DataType>,
    pub bindings: Vec<ReflectedBinding>,
    pub push_constant_blocks: u32,
}

struct RawInst<'a> {
    opcode: u16,
    operands: &'a [u32],
}

fn raw_instructions(words: &[u32]) -> Result<Vec<RawInst>> {
    if words.len() < 5 || words[0] != SPIRV_MAGIC {
        return Err(SquallError::INVALID_BYTECODE);
    }
    let mut insts = Vec::new();
    let mut ptr = 5;
    while ptr < words.len() {
        let word = words[ptr];
        let word_count = (word >> 16) as usize;
        if word_count == 0 || ptr + word_count > words.len() {
            return Err(SquallError::INVALID_BYTECODE);
        }
        insts.push(RawInst {
            opcode: (word & 0xffff) as u16,
            operands: &words[ptr + 1..ptr + word_count],
        });
        ptr += word_count;
    }
    Ok(insts)
}

/// Literal strings are nul-terminated and packed little-endian,
/// four bytes per word
fn parse_string(words: &[u32]) -> String {
    let mut bytes = Vec::with_capacity(words.len() * 4);
    'outer: for word in words {
        for i in 0..4 {
            let byte = ((word >> (i * 8)) & 0xff) as u8;
            if byte == 0 {
                break 'outer;
            }
            bytes.push(byte);
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Ty {
    Void,
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, columns: u32 },
    Image { dim: u32, sampled: u32 },
    Sampler,
    SampledImage { image: u32 },
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct,
    Pointer { pointee: u32 },
}

struct ModuleInfo {
    names: HashMap<u32, String>,
    member_names: HashMap<(u32, u32), String>,
    /// id -> (decoration value, literal operand)
    decorations: HashMap<u32, Vec<(u32, u32)>>,
    member_offsets: HashMap<(u32, u32), u32>,
    types: HashMap<u32, Ty>,
    struct_members: HashMap<u32, Vec<u32>>,
    constants: HashMap<u32, u32>,
    /// (result id, pointer type id, storage class)
    variables: Vec<(u32, u32, u32)>,
}

fn op(code: spirv::Op) -> u16 {
    code as u16
}

fn gather(words: &[u32]) -> Result<ModuleInfo> {
    let mut info = ModuleInfo {
        names: HashMap::new(),
        member_names: HashMap::new(),
        decorations: HashMap::new(),
        member_offsets: HashMap::new(),
        types: HashMap::new(),
        struct_members: HashMap::new(),
        constants: HashMap::new(),
        variables: Vec::new(),
    };

    for inst in raw_instructions(words)? {
        let ops = inst.operands;
        let code = inst.opcode;
        if code == op(spirv::Op::Name) && ops.len() >= 1 {
            info.names.insert(ops[0], parse_string(&ops[1..]));
        } else if code == op(spirv::Op::MemberName) && ops.len() >= 2 {
            info.member_names
                .insert((ops[0], ops[1]), parse_string(&ops[2..]));
        } else if code == op(spirv::Op::Decorate) && ops.len() >= 2 {
            let literal = if ops.len() > 2 { ops[2] } else { 0 };
            info.decorations
                .entry(ops[0])
                .or_insert_with(Vec::new)
                .push((ops[1], literal));
        } else if code == op(spirv::Op::MemberDecorate) && ops.len() >= 3 {
            if ops[2] == spirv::Decoration::Offset as u32 && ops.len() >= 4 {
                info.member_offsets.insert((ops[0], ops[1]), ops[3]);
            }
        } else if code == op(spirv::Op::TypeVoid) {
            info.types.insert(ops[0], Ty::Void);
        } else if code == op(spirv::Op::TypeBool) {
            info.types.insert(ops[0], Ty::Bool);
        } else if code == op(spirv::Op::TypeInt) && ops.len() >= 3 {
            info.types.insert(
                ops[0],
                Ty::Int {
                    width: ops[1],
                    signed: ops[2] != 0,
                },
            );
        } else if code == op(spirv::Op::TypeFloat) && ops.len() >= 2 {
            info.types.insert(ops[0], Ty::Float { width: ops[1] });
        } else if code == op(spirv::Op::TypeVector) && ops.len() >= 3 {
            info.types.insert(
                ops[0],
                Ty::Vector {
                    component: ops[1],
                    count: ops[2],
                },
            );
        } else if code == op(spirv::Op::TypeMatrix) && ops.len() >= 3 {
            info.types.insert(
                ops[0],
                Ty::Matrix {
                    column: ops[1],
                    columns: ops[2],
                },
            );
        } else if code == op(spirv::Op::TypeImage) && ops.len() >= 7 {
            info.types.insert(
                ops[0],
                Ty::Image {
                    dim: ops[2],
                    sampled: ops[6],
                },
            );
        } else if code == op(spirv::Op::TypeSampler) {
            info.types.insert(ops[0], Ty::Sampler);
        } else if code == op(spirv::Op::TypeSampledImage) && ops.len() >= 2 {
            info.types.insert(ops[0], Ty::SampledImage { image: ops[1] });
        } else if code == op(spirv::Op::TypeArray) && ops.len() >= 3 {
            info.types.insert(
                ops[0],
                Ty::Array {
                    element: ops[1],
                    length_id: ops[2],
                },
            );
        } else if code == op(spirv::Op::TypeRuntimeArray) && ops.len() >= 2 {
            info.types.insert(ops[0], Ty::RuntimeArray { element: ops[1] });
        } else if code == op(spirv::Op::TypeStruct) {
            info.types.insert(ops[0], Ty::Struct);
            info.struct_members.insert(ops[0], ops[1..].to_vec());
        } else if code == op(spirv::Op::TypePointer) && ops.len() >= 3 {
            info.types.insert(ops[0], Ty::Pointer { pointee: ops[2] });
        } else if code == op(spirv::Op::Constant) && ops.len() >= 3 {
            // Only 32-bit constants matter here (array lengths)
            info.constants.insert(ops[1], ops[2]);
        } else if code == op(spirv::Op::Variable) && ops.len() >= 3 {
            info.variables.push((ops[1], ops[0], ops[2]));
        }
    }

    Ok(info)
}

impl ModuleInfo {
    fn decoration(&self, id: u32, which: spirv::Decoration) -> Option<u32> {
        self.decorations
            .get(&id)?
            .iter()
            .find(|(d, _)| *d == which as u32)
            .map(|(_, v)| *v)
    }

    fn has_decoration(&self, id: u32, which: spirv::Decoration) -> bool {
        self.decoration(id, which).is_some()
    }

    /// 32-bit scalar or vector type, if this type is one
    fn data_type(&self, id: u32) -> Option<DataType> {
        match *self.types.get(&id)? {
            Ty::Float { width: 32 } => Some(DataType::Float),
            Ty::Int {
                width: 32,
                signed: true,
            } => Some(DataType::Int),
            Ty::Int {
                width: 32,
                signed: false,
            } => Some(DataType::UInt),
            Ty::Vector { component, count } => {
                let comp = self.data_type(component)?;
                match (comp, count) {
                    (DataType::Float, 2) => Some(DataType::Vec2),
                    (DataType::Float, 3) => Some(DataType::Vec3),
                    (DataType::Float, 4) => Some(DataType::Vec4),
                    (DataType::Int, 2) => Some(DataType::IVec2),
                    (DataType::Int, 3) => Some(DataType::IVec3),
                    (DataType::Int, 4) => Some(DataType::IVec4),
                    (DataType::UInt, 2) => Some(DataType::UVec2),
                    (DataType::UInt, 3) => Some(DataType::UVec3),
                    (DataType::UInt, 4) => Some(DataType::UVec4),
                    _ => None,
                }
            }
            _ => None,
        }
    }

    /// Strip arrays off a type, multiplying the element count
    fn resolve_arrays(&self, mut id: u32) -> Result<(u32, u32)> {
        let mut count = 1;
        loop {
            match self.types.get(&id) {
                Some(Ty::Array { element, length_id }) => {
                    let length = *self
                        .constants
                        .get(length_id)
                        .ok_or(SquallError::INVALID_BYTECODE)?;
                    count *= length;
                    id = *element;
                }
                Some(Ty::RuntimeArray { .. }) => {
                    log::error!("Unsized descriptor arrays are not supported");
                    return Err(SquallError::INVALID_BYTECODE);
                }
                _ => return Ok((id, count)),
            }
        }
    }

    fn image_dim(&self, dim: u32) -> Result<ImageDim> {
        if dim == spirv::Dim::Dim1D as u32 {
            Ok(ImageDim::D1)
        } else if dim == spirv::Dim::Dim2D as u32 {
            Ok(ImageDim::D2)
        } else if dim == spirv::Dim::Dim3D as u32 {
            Ok(ImageDim::D3)
        } else if dim == spirv::Dim::DimCube as u32 {
            Ok(ImageDim::Cube)
        } else {
            log::error!("Unsupported image dimensionality in shader");
            Err(SquallError::INVALID_BYTECODE)
        }
    }

    fn reflect_block(&self, struct_id: u32) -> Result<ReflectedBlock> {
        let members = self
            .struct_members
            .get(&struct_id)
            .ok_or(SquallError::INVALID_BYTECODE)?;
        let mut out = ReflectedBlock {
            size: 0,
            members: Vec::with_capacity(members.len()),
        };
        for (i, member_ty) in members.iter().enumerate() {
            let ty = match self.data_type(*member_ty) {
                Some(t) => t,
                None => {
                    log::error!(
                        "Only 32-bit scalar and vector types are allowed in material definitions"
                    );
                    return Err(SquallError::INVALID_BYTECODE);
                }
            };
            let offset = *self
                .member_offsets
                .get(&(struct_id, i as u32))
                .ok_or(SquallError::INVALID_BYTECODE)?;
            let name = self
                .member_names
                .get(&(struct_id, i as u32))
                .cloned()
                .unwrap_or_default();
            out.size = std::cmp::max(out.size, offset + ty.size());
            out.members.push((name, ty, offset));
        }
        Ok(out)
    }
}

/// Reflect one stage's bytecode.
///
/// `vertex_stage` additionally enumerates the input attributes,
/// which must sit at contiguous locations starting from zero.
pub(crate) fn reflect_stage(words: &[u32], vertex_stage: bool) -> Result<StageReflection> {
    let info = gather(words)?;

    let mut reflection = StageReflection {
        inputs: Vec::new(),
        bindings: Vec::new(),
        push_constant_blocks: 0,
    };

    let mut inputs: Vec<(u32, DataType)> = Vec::new();

    for &(id, pointer_ty, storage) in info.variables.iter() {
        let pointee = match info.types.get(&pointer_ty) {
            Some(Ty::Pointer { pointee }) => *pointee,
            _ => return Err(SquallError::INVALID_BYTECODE),
        };

        if storage == spirv::StorageClass::Input as u32 {
            if !vertex_stage || info.has_decoration(id, spirv::Decoration::BuiltIn) {
                continue;
            }
            let location = match info.decoration(id, spirv::Decoration::Location) {
                Some(l) => l,
                None => continue,
            };
            let ty = match info.data_type(pointee) {
                Some(t) => t,
                None => {
                    log::error!("Unsupported vertex attribute type at location {}", location);
                    return Err(SquallError::INVALID_BYTECODE);
                }
            };
            inputs.push((location, ty));
        } else if storage == spirv::StorageClass::PushConstant as u32 {
            reflection.push_constant_blocks += 1;
        } else if storage == spirv::StorageClass::Uniform as u32
            || storage == spirv::StorageClass::UniformConstant as u32
        {
            let set = match info.decoration(id, spirv::Decoration::DescriptorSet) {
                Some(s) => s,
                None => continue,
            };
            let binding = match info.decoration(id, spirv::Decoration::Binding) {
                Some(b) => b,
                None => continue,
            };
            let (inner, count) = info.resolve_arrays(pointee)?;

            let name = info.names.get(&id).cloned().unwrap_or_default();
            let reflected = match info.types.get(&inner) {
                Some(Ty::Struct) => {
                    // Uniform blocks carry the Block decoration on
                    // their struct type
                    if !info.has_decoration(inner, spirv::Decoration::Block) {
                        log::error!("Unsupported buffer type in shader");
                        return Err(SquallError::INVALID_BYTECODE);
                    }
                    ReflectedBinding {
                        set: set,
                        binding: binding,
                        ty: DescriptorType::UniformBuffer,
                        count: count,
                        dim: ImageDim::D2,
                        name: name,
                        block: Some(info.reflect_block(inner)?),
                    }
                }
                Some(Ty::SampledImage { image }) => {
                    let dim = match info.types.get(image) {
                        Some(Ty::Image { dim, .. }) => info.image_dim(*dim)?,
                        _ => return Err(SquallError::INVALID_BYTECODE),
                    };
                    ReflectedBinding {
                        set: set,
                        binding: binding,
                        ty: DescriptorType::CombinedImageSampler,
                        count: count,
                        dim: dim,
                        name: name,
                        block: None,
                    }
                }
                Some(Ty::Image { dim, sampled }) => {
                    if *sampled != 1 {
                        log::error!("Storage images are not supported");
                        return Err(SquallError::INVALID_BYTECODE);
                    }
                    ReflectedBinding {
                        set: set,
                        binding: binding,
                        ty: DescriptorType::SampledImage,
                        count: count,
                        dim: info.image_dim(*dim)?,
                        name: name,
                        block: None,
                    }
                }
                Some(Ty::Sampler) => ReflectedBinding {
                    set: set,
                    binding: binding,
                    ty: DescriptorType::Sampler,
                    count: count,
                    dim: ImageDim::D2,
                    name: name,
                    block: None,
                },
                _ => {
                    log::error!("Unsupported descriptor type in shader");
                    return Err(SquallError::INVALID_BYTECODE);
                }
            };
            reflection.bindings.push(reflected);
        }
    }

    if vertex_stage {
        if inputs.len() > Limits::NUM_VERTEX_ATTRIBUTES {
            log::error!("Too many vertex attributes");
            return Err(SquallError::LIMIT_EXCEEDED);
        }
        inputs.sort_by_key(|(location, _)| *location);
        for (i, (location, ty)) in inputs.iter().enumerate() {
            if *location != i as u32 {
                log::error!("Incontinuous vertex attribute locations are not supported");
                return Err(SquallError::INVALID_BYTECODE);
            }
            reflection.inputs.push(*ty);
        }
    }

    Ok(reflection)
}
