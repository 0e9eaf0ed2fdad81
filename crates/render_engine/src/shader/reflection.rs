//! SPIR-V reflection
//!
//! A small word-stream walk over little-endian SPIR-V producing the data the
//! pipeline factory needs: vertex input attributes, resource bindings, push
//! constant members and specialization constant names. Instruction order is
//! not assumed; everything is collected in one pass and resolved afterwards.

use ash::vk;
use fxhash::FxHashMap;

use crate::error::{GfxResult, GraphicsError};
use crate::shader::ShaderStage;

const SPIRV_MAGIC: u32 = 0x0723_0203;

// Opcodes
const OP_NAME: u32 = 5;
const OP_MEMBER_NAME: u32 = 6;
const OP_ENTRY_POINT: u32 = 15;
const OP_TYPE_BOOL: u32 = 20;
const OP_TYPE_INT: u32 = 21;
const OP_TYPE_FLOAT: u32 = 22;
const OP_TYPE_VECTOR: u32 = 23;
const OP_TYPE_MATRIX: u32 = 24;
const OP_TYPE_IMAGE: u32 = 25;
const OP_TYPE_SAMPLER: u32 = 26;
const OP_TYPE_SAMPLED_IMAGE: u32 = 27;
const OP_TYPE_ARRAY: u32 = 28;
const OP_TYPE_RUNTIME_ARRAY: u32 = 29;
const OP_TYPE_STRUCT: u32 = 30;
const OP_TYPE_POINTER: u32 = 32;
const OP_CONSTANT: u32 = 43;
const OP_SPEC_CONSTANT_TRUE: u32 = 48;
const OP_SPEC_CONSTANT_FALSE: u32 = 49;
const OP_SPEC_CONSTANT: u32 = 50;
const OP_VARIABLE: u32 = 59;
const OP_DECORATE: u32 = 71;
const OP_MEMBER_DECORATE: u32 = 72;

// Decorations
const DECORATION_SPEC_ID: u32 = 1;
const DECORATION_BLOCK: u32 = 2;
const DECORATION_BUFFER_BLOCK: u32 = 3;
const DECORATION_LOCATION: u32 = 30;
const DECORATION_BINDING: u32 = 33;
const DECORATION_DESCRIPTOR_SET: u32 = 34;
const DECORATION_OFFSET: u32 = 35;

// Storage classes
const STORAGE_UNIFORM_CONSTANT: u32 = 0;
const STORAGE_INPUT: u32 = 1;
const STORAGE_UNIFORM: u32 = 2;
const STORAGE_PUSH_CONSTANT: u32 = 9;
const STORAGE_STORAGE_BUFFER: u32 = 12;

// Execution models
const EXEC_MODEL_VERTEX: u32 = 0;
const EXEC_MODEL_FRAGMENT: u32 = 4;
const EXEC_MODEL_GL_COMPUTE: u32 = 5;
const EXEC_MODEL_TASK_EXT: u32 = 5364;
const EXEC_MODEL_MESH_EXT: u32 = 5365;

/// Kind of a reflected resource binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderResourceKind {
    /// Separately-bound sampled image
    SampledImage,
    /// Storage (UAV) image
    StorageImage,
    /// Separately-bound sampler
    Sampler,
    /// Combined image + sampler
    CombinedImageSampler,
    /// Uniform buffer block
    UniformBuffer,
    /// Storage buffer block
    StorageBuffer,
}

/// A vertex input attribute of the entry point
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderInputAttribute {
    /// Input location
    pub location: u32,
    /// Attribute format implied by the SPIR-V type
    pub format: vk::Format,
    /// Debug name from `OpName` (empty when stripped)
    pub name: String,
}

/// A descriptor binding the shader consumes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderResourceBinding {
    /// Debug name from `OpName`
    pub name: String,
    /// Descriptor set index
    pub set: u32,
    /// Binding index within the set
    pub binding: u32,
    /// Array element count; 0 = unbounded runtime array
    pub count: u32,
    /// Binding kind
    pub kind: ShaderResourceKind,
}

/// One member of the push constant block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderRootConstant {
    /// Member name
    pub name: String,
    /// Byte offset within the block
    pub offset: u32,
    /// Member size in bytes
    pub byte_size: u32,
}

/// A specialization constant declared by the shader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecConstant {
    /// Debug name from `OpName`
    pub name: String,
    /// `constant_id` used in `VkSpecializationMapEntry`
    pub constant_id: u32,
}

/// Reflection output of one shader module
#[derive(Debug, Clone)]
pub struct ShaderReflection {
    /// Entry point function name
    pub entry_point: String,
    /// Pipeline stage of the entry point
    pub stage: ShaderStage,
    /// Vertex input attributes (vertex stage only)
    pub inputs: Vec<ShaderInputAttribute>,
    /// Descriptor bindings
    pub bindings: Vec<ShaderResourceBinding>,
    /// Push constant block members
    pub root_constants: Vec<ShaderRootConstant>,
    /// Total push constant block size in bytes
    pub push_constant_size: u32,
    /// Specialization constants
    pub spec_constants: Vec<SpecConstant>,
}

impl ShaderReflection {
    /// Find a binding index by debug name
    pub fn binding_by_name(&self, name: &str) -> Option<&ShaderResourceBinding> {
        self.bindings.iter().find(|binding| binding.name == name)
    }

    /// Find an input attribute location by debug name
    pub fn input_location(&self, name: &str) -> Option<u32> {
        self.inputs
            .iter()
            .find(|input| input.name == name)
            .map(|input| input.location)
    }
}

/// Reinterpret a SPIR-V byte stream as words, validating magic and
/// endianness
pub fn words_from_bytes(bytes: &[u8]) -> GfxResult<Vec<u32>> {
    if bytes.len() < 20 || bytes.len() % 4 != 0 {
        return Err(GraphicsError::Shader(
            "SPIR-V binary has invalid length".to_string(),
        ));
    }

    let words: Vec<u32> = bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect();

    if words[0] != SPIRV_MAGIC {
        return Err(GraphicsError::Shader(
            "SPIR-V binary has wrong magic number (big-endian modules are not accepted)".to_string(),
        ));
    }
    Ok(words)
}

#[derive(Debug, Clone)]
enum TypeInfo {
    Bool,
    Int { width: u32, signed: bool },
    Float { width: u32 },
    Vector { component: u32, count: u32 },
    Matrix { column: u32, count: u32 },
    Image { sampled: u32 },
    Sampler,
    SampledImage,
    Array { element: u32, length_id: u32 },
    RuntimeArray { element: u32 },
    Struct { members: Vec<u32> },
    Pointer { storage_class: u32, pointee: u32 },
}

#[derive(Default)]
struct ModuleInfo {
    names: FxHashMap<u32, String>,
    member_names: FxHashMap<(u32, u32), String>,
    types: FxHashMap<u32, TypeInfo>,
    constants: FxHashMap<u32, u32>,
    variables: Vec<(u32, u32, u32)>, // (id, pointer type, storage class)
    locations: FxHashMap<u32, u32>,
    bindings: FxHashMap<u32, u32>,
    descriptor_sets: FxHashMap<u32, u32>,
    spec_ids: FxHashMap<u32, u32>,
    block_types: Vec<u32>,
    buffer_block_types: Vec<u32>,
    member_offsets: FxHashMap<(u32, u32), u32>,
    entry_point: Option<(u32, String)>,
}

fn decode_string(operands: &[u32]) -> (String, usize) {
    let mut bytes = Vec::new();
    let mut consumed = 0;
    'words: for &word in operands {
        consumed += 1;
        for byte in word.to_le_bytes() {
            if byte == 0 {
                break 'words;
            }
            bytes.push(byte);
        }
    }
    (String::from_utf8_lossy(&bytes).into_owned(), consumed)
}

fn collect(words: &[u32]) -> GfxResult<ModuleInfo> {
    let mut info = ModuleInfo::default();

    let mut cursor = 5; // past the header
    while cursor < words.len() {
        let word = words[cursor];
        let word_count = (word >> 16) as usize;
        let opcode = word & 0xFFFF;
        if word_count == 0 || cursor + word_count > words.len() {
            return Err(GraphicsError::Shader(
                "malformed SPIR-V instruction stream".to_string(),
            ));
        }
        let operands = &words[cursor + 1..cursor + word_count];

        match opcode {
            OP_NAME => {
                let (name, _) = decode_string(&operands[1..]);
                info.names.insert(operands[0], name);
            }
            OP_MEMBER_NAME => {
                let (name, _) = decode_string(&operands[2..]);
                info.member_names.insert((operands[0], operands[1]), name);
            }
            OP_ENTRY_POINT => {
                let (name, _) = decode_string(&operands[2..]);
                info.entry_point = Some((operands[0], name));
            }
            OP_TYPE_BOOL => {
                info.types.insert(operands[0], TypeInfo::Bool);
            }
            OP_TYPE_INT => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Int {
                        width: operands[1],
                        signed: operands[2] != 0,
                    },
                );
            }
            OP_TYPE_FLOAT => {
                info.types
                    .insert(operands[0], TypeInfo::Float { width: operands[1] });
            }
            OP_TYPE_VECTOR => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Vector {
                        component: operands[1],
                        count: operands[2],
                    },
                );
            }
            OP_TYPE_MATRIX => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Matrix {
                        column: operands[1],
                        count: operands[2],
                    },
                );
            }
            OP_TYPE_IMAGE => {
                info.types
                    .insert(operands[0], TypeInfo::Image { sampled: operands[6] });
            }
            OP_TYPE_SAMPLER => {
                info.types.insert(operands[0], TypeInfo::Sampler);
            }
            OP_TYPE_SAMPLED_IMAGE => {
                info.types.insert(operands[0], TypeInfo::SampledImage);
            }
            OP_TYPE_ARRAY => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Array {
                        element: operands[1],
                        length_id: operands[2],
                    },
                );
            }
            OP_TYPE_RUNTIME_ARRAY => {
                info.types
                    .insert(operands[0], TypeInfo::RuntimeArray { element: operands[1] });
            }
            OP_TYPE_STRUCT => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Struct {
                        members: operands[1..].to_vec(),
                    },
                );
            }
            OP_TYPE_POINTER => {
                info.types.insert(
                    operands[0],
                    TypeInfo::Pointer {
                        storage_class: operands[1],
                        pointee: operands[2],
                    },
                );
            }
            OP_CONSTANT => {
                // Result id -> value; only 32-bit scalars matter here
                // (array lengths).
                if operands.len() >= 3 {
                    info.constants.insert(operands[1], operands[2]);
                }
            }
            OP_SPEC_CONSTANT | OP_SPEC_CONSTANT_TRUE | OP_SPEC_CONSTANT_FALSE => {
                // Presence is enough; the SpecId decoration carries the
                // constant id.
                info.constants.entry(operands[1]).or_insert(0);
            }
            OP_VARIABLE => {
                info.variables.push((operands[1], operands[0], operands[2]));
            }
            OP_DECORATE => {
                let target = operands[0];
                match operands[1] {
                    DECORATION_LOCATION => {
                        info.locations.insert(target, operands[2]);
                    }
                    DECORATION_BINDING => {
                        info.bindings.insert(target, operands[2]);
                    }
                    DECORATION_DESCRIPTOR_SET => {
                        info.descriptor_sets.insert(target, operands[2]);
                    }
                    DECORATION_SPEC_ID => {
                        info.spec_ids.insert(target, operands[2]);
                    }
                    DECORATION_BLOCK => info.block_types.push(target),
                    DECORATION_BUFFER_BLOCK => info.buffer_block_types.push(target),
                    _ => {}
                }
            }
            OP_MEMBER_DECORATE => {
                if operands[2] == DECORATION_OFFSET {
                    info.member_offsets
                        .insert((operands[0], operands[1]), operands[3]);
                }
            }
            _ => {}
        }

        cursor += word_count;
    }

    Ok(info)
}

fn type_size(info: &ModuleInfo, type_id: u32) -> u32 {
    match info.types.get(&type_id) {
        Some(TypeInfo::Bool) => 4,
        Some(TypeInfo::Int { width, .. }) | Some(TypeInfo::Float { width }) => width / 8,
        Some(TypeInfo::Vector { component, count }) => type_size(info, *component) * count,
        Some(TypeInfo::Matrix { column, count }) => type_size(info, *column) * count,
        Some(TypeInfo::Array { element, length_id }) => {
            let length = info.constants.get(length_id).copied().unwrap_or(1);
            type_size(info, *element) * length
        }
        Some(TypeInfo::Struct { members }) => {
            members.iter().map(|&member| type_size(info, member)).sum()
        }
        _ => 0,
    }
}

fn input_format(info: &ModuleInfo, type_id: u32) -> vk::Format {
    match info.types.get(&type_id) {
        Some(TypeInfo::Float { width: 32 }) => vk::Format::R32_SFLOAT,
        Some(TypeInfo::Int { width: 32, signed: true }) => vk::Format::R32_SINT,
        Some(TypeInfo::Int { width: 32, signed: false }) => vk::Format::R32_UINT,
        Some(TypeInfo::Vector { component, count }) => {
            match (info.types.get(component), count) {
                (Some(TypeInfo::Float { width: 32 }), 2) => vk::Format::R32G32_SFLOAT,
                (Some(TypeInfo::Float { width: 32 }), 3) => vk::Format::R32G32B32_SFLOAT,
                (Some(TypeInfo::Float { width: 32 }), 4) => vk::Format::R32G32B32A32_SFLOAT,
                (Some(TypeInfo::Int { width: 32, signed: true }), 2) => vk::Format::R32G32_SINT,
                (Some(TypeInfo::Int { width: 32, signed: true }), 3) => vk::Format::R32G32B32_SINT,
                (Some(TypeInfo::Int { width: 32, signed: true }), 4) => {
                    vk::Format::R32G32B32A32_SINT
                }
                (Some(TypeInfo::Int { width: 32, signed: false }), 2) => vk::Format::R32G32_UINT,
                (Some(TypeInfo::Int { width: 32, signed: false }), 3) => vk::Format::R32G32B32_UINT,
                (Some(TypeInfo::Int { width: 32, signed: false }), 4) => {
                    vk::Format::R32G32B32A32_UINT
                }
                _ => vk::Format::UNDEFINED,
            }
        }
        _ => vk::Format::UNDEFINED,
    }
}

/// Strip arrays around a resource type; returns (element type, count)
fn unwrap_array(info: &ModuleInfo, type_id: u32) -> (u32, u32) {
    match info.types.get(&type_id) {
        Some(TypeInfo::Array { element, length_id }) => {
            let length = info.constants.get(length_id).copied().unwrap_or(1);
            (*element, length)
        }
        Some(TypeInfo::RuntimeArray { element }) => (*element, 0),
        _ => (type_id, 1),
    }
}

/// Reflect a SPIR-V module
pub fn reflect(words: &[u32]) -> GfxResult<ShaderReflection> {
    if words.len() < 5 || words[0] != SPIRV_MAGIC {
        return Err(GraphicsError::Shader("not a SPIR-V module".to_string()));
    }

    let info = collect(words)?;

    let (exec_model, entry_point) = info
        .entry_point
        .clone()
        .ok_or_else(|| GraphicsError::Shader("SPIR-V module has no entry point".to_string()))?;

    let stage = match exec_model {
        EXEC_MODEL_VERTEX => ShaderStage::Vertex,
        EXEC_MODEL_FRAGMENT => ShaderStage::Fragment,
        EXEC_MODEL_GL_COMPUTE => ShaderStage::Compute,
        EXEC_MODEL_TASK_EXT => ShaderStage::Task,
        EXEC_MODEL_MESH_EXT => ShaderStage::Mesh,
        other => {
            return Err(GraphicsError::Shader(format!(
                "unsupported execution model {other}"
            )))
        }
    };

    let mut inputs = Vec::new();
    let mut bindings = Vec::new();
    let mut root_constants = Vec::new();
    let mut push_constant_size = 0;

    for &(id, pointer_type, storage_class) in &info.variables {
        let Some(TypeInfo::Pointer { pointee, .. }) = info.types.get(&pointer_type) else {
            continue;
        };
        let pointee = *pointee;
        let name = info.names.get(&id).cloned().unwrap_or_default();

        match storage_class {
            STORAGE_INPUT if stage == ShaderStage::Vertex => {
                // Builtins carry no location decoration; skip them.
                let Some(&location) = info.locations.get(&id) else {
                    continue;
                };
                inputs.push(ShaderInputAttribute {
                    location,
                    format: input_format(&info, pointee),
                    name,
                });
            }
            STORAGE_UNIFORM_CONSTANT => {
                let (element_type, count) = unwrap_array(&info, pointee);
                let kind = match info.types.get(&element_type) {
                    Some(TypeInfo::Image { sampled: 2 }) => ShaderResourceKind::StorageImage,
                    Some(TypeInfo::Image { .. }) => ShaderResourceKind::SampledImage,
                    Some(TypeInfo::Sampler) => ShaderResourceKind::Sampler,
                    Some(TypeInfo::SampledImage) => ShaderResourceKind::CombinedImageSampler,
                    _ => continue,
                };
                bindings.push(ShaderResourceBinding {
                    name,
                    set: info.descriptor_sets.get(&id).copied().unwrap_or(0),
                    binding: info.bindings.get(&id).copied().unwrap_or(0),
                    count,
                    kind,
                });
            }
            STORAGE_UNIFORM | STORAGE_STORAGE_BUFFER => {
                let (element_type, count) = unwrap_array(&info, pointee);
                let kind = if storage_class == STORAGE_STORAGE_BUFFER
                    || info.buffer_block_types.contains(&element_type)
                {
                    ShaderResourceKind::StorageBuffer
                } else {
                    ShaderResourceKind::UniformBuffer
                };
                bindings.push(ShaderResourceBinding {
                    name,
                    set: info.descriptor_sets.get(&id).copied().unwrap_or(0),
                    binding: info.bindings.get(&id).copied().unwrap_or(0),
                    count,
                    kind,
                });
            }
            STORAGE_PUSH_CONSTANT => {
                let Some(TypeInfo::Struct { members }) = info.types.get(&pointee) else {
                    continue;
                };
                for (member_index, &member_type) in members.iter().enumerate() {
                    let member_index = member_index as u32;
                    let offset = info
                        .member_offsets
                        .get(&(pointee, member_index))
                        .copied()
                        .unwrap_or(0);
                    let byte_size = type_size(&info, member_type);
                    push_constant_size = push_constant_size.max(offset + byte_size);
                    root_constants.push(ShaderRootConstant {
                        name: info
                            .member_names
                            .get(&(pointee, member_index))
                            .cloned()
                            .unwrap_or_default(),
                        offset,
                        byte_size,
                    });
                }
            }
            _ => {}
        }
    }

    let mut spec_constants: Vec<SpecConstant> = info
        .spec_ids
        .iter()
        .map(|(&id, &constant_id)| SpecConstant {
            name: info.names.get(&id).cloned().unwrap_or_default(),
            constant_id,
        })
        .collect();
    spec_constants.sort_by_key(|constant| constant.constant_id);

    inputs.sort_by_key(|input| input.location);
    bindings.sort_by_key(|binding| (binding.set, binding.binding));
    root_constants.sort_by_key(|constant| constant.offset);

    Ok(ShaderReflection {
        entry_point,
        stage,
        inputs,
        bindings,
        root_constants,
        push_constant_size,
        spec_constants,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal vertex shader module:
    /// - one vec3 input named "position" at location 0
    /// - one sampled image "albedo_tex" at set 0, binding 5
    /// - one bool spec constant "ENABLE_FOO" with constant id 7
    /// - one push constant block with a float member "exposure" at offset 0
    fn build_test_module() -> Vec<u32> {
        fn string_words(text: &str) -> Vec<u32> {
            let mut bytes = text.as_bytes().to_vec();
            bytes.push(0);
            while bytes.len() % 4 != 0 {
                bytes.push(0);
            }
            bytes
                .chunks_exact(4)
                .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect()
        }
        fn instruction(opcode: u32, operands: &[u32]) -> Vec<u32> {
            let mut words = vec![((operands.len() as u32 + 1) << 16) | opcode];
            words.extend_from_slice(operands);
            words
        }

        let mut module = vec![SPIRV_MAGIC, 0x0001_0500, 0, 32, 0];

        // OpCapability Shader
        module.extend(instruction(17, &[1]));
        // OpMemoryModel Logical GLSL450
        module.extend(instruction(14, &[0, 1]));
        // OpEntryPoint Vertex %4 "main" %9
        let mut entry = vec![0, 4];
        entry.extend(string_words("main"));
        entry.push(9);
        module.extend(instruction(OP_ENTRY_POINT, &entry));

        // Debug names
        let mut name = vec![9];
        name.extend(string_words("position"));
        module.extend(instruction(OP_NAME, &name));
        let mut name = vec![12];
        name.extend(string_words("albedo_tex"));
        module.extend(instruction(OP_NAME, &name));
        let mut name = vec![13];
        name.extend(string_words("ENABLE_FOO"));
        module.extend(instruction(OP_NAME, &name));
        let mut member_name = vec![20, 0];
        member_name.extend(string_words("exposure"));
        module.extend(instruction(OP_MEMBER_NAME, &member_name));

        // Decorations
        module.extend(instruction(OP_DECORATE, &[9, DECORATION_LOCATION, 0]));
        module.extend(instruction(OP_DECORATE, &[12, DECORATION_DESCRIPTOR_SET, 0]));
        module.extend(instruction(OP_DECORATE, &[12, DECORATION_BINDING, 5]));
        module.extend(instruction(OP_DECORATE, &[13, DECORATION_SPEC_ID, 7]));
        module.extend(instruction(OP_DECORATE, &[20, DECORATION_BLOCK]));
        module.extend(instruction(OP_MEMBER_DECORATE, &[20, 0, DECORATION_OFFSET, 0]));

        // Types and variables
        module.extend(instruction(OP_TYPE_FLOAT, &[6, 32]));
        module.extend(instruction(OP_TYPE_VECTOR, &[7, 6, 3]));
        module.extend(instruction(OP_TYPE_POINTER, &[8, STORAGE_INPUT, 7]));
        module.extend(instruction(OP_VARIABLE, &[8, 9, STORAGE_INPUT]));
        module.extend(instruction(OP_TYPE_IMAGE, &[10, 6, 1, 0, 0, 0, 1, 0]));
        module.extend(instruction(OP_TYPE_POINTER, &[11, STORAGE_UNIFORM_CONSTANT, 10]));
        module.extend(instruction(OP_VARIABLE, &[11, 12, STORAGE_UNIFORM_CONSTANT]));
        module.extend(instruction(OP_TYPE_BOOL, &[14]));
        module.extend(instruction(OP_SPEC_CONSTANT_TRUE, &[14, 13]));
        module.extend(instruction(OP_TYPE_STRUCT, &[20, 6]));
        module.extend(instruction(OP_TYPE_POINTER, &[21, STORAGE_PUSH_CONSTANT, 20]));
        module.extend(instruction(OP_VARIABLE, &[21, 22, STORAGE_PUSH_CONSTANT]));

        module
    }

    #[test]
    fn test_reflect_entry_point_and_stage() {
        let module = build_test_module();
        let reflection = reflect(&module).unwrap();
        assert_eq!(reflection.entry_point, "main");
        assert_eq!(reflection.stage, ShaderStage::Vertex);
    }

    #[test]
    fn test_reflect_vertex_input() {
        let reflection = reflect(&build_test_module()).unwrap();
        assert_eq!(reflection.inputs.len(), 1);
        let input = &reflection.inputs[0];
        assert_eq!(input.location, 0);
        assert_eq!(input.format, vk::Format::R32G32B32_SFLOAT);
        assert_eq!(input.name, "position");
        assert_eq!(reflection.input_location("position"), Some(0));
    }

    #[test]
    fn test_reflect_resource_binding() {
        let reflection = reflect(&build_test_module()).unwrap();
        assert_eq!(reflection.bindings.len(), 1);
        let binding = reflection.binding_by_name("albedo_tex").unwrap();
        assert_eq!(binding.set, 0);
        assert_eq!(binding.binding, 5);
        assert_eq!(binding.count, 1);
        assert_eq!(binding.kind, ShaderResourceKind::SampledImage);
    }

    #[test]
    fn test_reflect_spec_constants() {
        let reflection = reflect(&build_test_module()).unwrap();
        assert_eq!(reflection.spec_constants.len(), 1);
        assert_eq!(reflection.spec_constants[0].name, "ENABLE_FOO");
        assert_eq!(reflection.spec_constants[0].constant_id, 7);
    }

    #[test]
    fn test_reflect_push_constants() {
        let reflection = reflect(&build_test_module()).unwrap();
        assert_eq!(reflection.root_constants.len(), 1);
        assert_eq!(reflection.root_constants[0].name, "exposure");
        assert_eq!(reflection.root_constants[0].offset, 0);
        assert_eq!(reflection.root_constants[0].byte_size, 4);
        assert_eq!(reflection.push_constant_size, 4);
    }

    #[test]
    fn test_rejects_wrong_magic() {
        let mut module = build_test_module();
        module[0] = 0x1234_5678;
        assert!(reflect(&module).is_err());

        let bytes: Vec<u8> = module.iter().flat_map(|word| word.to_le_bytes()).collect();
        assert!(words_from_bytes(&bytes).is_err());
    }

    #[test]
    fn test_words_from_bytes_roundtrip() {
        let module = build_test_module();
        let bytes: Vec<u8> = module.iter().flat_map(|word| word.to_le_bytes()).collect();
        let words = words_from_bytes(&bytes).unwrap();
        assert_eq!(words, module);
    }
}
