//! Runtime-loaded NNAPI and Android shared-memory entry points via dlopen.

use std::ffi::{c_char, c_int, c_void};
use std::sync::OnceLock;

use libloading::Library;

use kestrel_core::{DeviceKind, EngineError};

// ---------------------------------------------------------------------------
// Result codes and enums
// ---------------------------------------------------------------------------

pub const ANEURALNETWORKS_NO_ERROR: c_int = 0;

// Operand types
pub const ANEURALNETWORKS_FLOAT32: i32 = 0;
pub const ANEURALNETWORKS_INT32: i32 = 1;
pub const ANEURALNETWORKS_TENSOR_FLOAT32: i32 = 3;
pub const ANEURALNETWORKS_TENSOR_INT32: i32 = 4;
pub const ANEURALNETWORKS_TENSOR_QUANT8_ASYMM: i32 = 5;
pub const ANEURALNETWORKS_TENSOR_QUANT16_SYMM: i32 = 7;
pub const ANEURALNETWORKS_TENSOR_FLOAT16: i32 = 8;
pub const ANEURALNETWORKS_TENSOR_QUANT8_SYMM: i32 = 13;

// Operations
pub const ANEURALNETWORKS_ADD: i32 = 0;
pub const ANEURALNETWORKS_FULLY_CONNECTED: i32 = 9;
pub const ANEURALNETWORKS_FUSED_NONE: i32 = 0;

pub const ANEURALNETWORKS_PREFER_FAST_SINGLE_ANSWER: i32 = 1;

// Opaque handles
pub type NnMemory = *mut c_void;
pub type NnModel = *mut c_void;
pub type NnCompilation = *mut c_void;
pub type NnExecution = *mut c_void;
pub type NnEvent = *mut c_void;

#[repr(C)]
pub struct ANeuralNetworksOperandType {
    pub type_: i32,
    pub dimension_count: u32,
    pub dimensions: *const u32,
    pub scale: f32,
    pub zero_point: i32,
}

// ---------------------------------------------------------------------------
// Function signatures
// ---------------------------------------------------------------------------

type FnMemoryCreateFromFd = unsafe extern "C" fn(usize, c_int, c_int, usize, *mut NnMemory) -> c_int;
type FnMemoryFree = unsafe extern "C" fn(NnMemory);
type FnModelCreate = unsafe extern "C" fn(*mut NnModel) -> c_int;
type FnModelFree = unsafe extern "C" fn(NnModel);
type FnModelFinish = unsafe extern "C" fn(NnModel) -> c_int;
type FnModelAddOperand = unsafe extern "C" fn(NnModel, *const ANeuralNetworksOperandType) -> c_int;
type FnModelSetOperandValue = unsafe extern "C" fn(NnModel, i32, *const c_void, usize) -> c_int;
type FnModelSetOperandValueFromMemory = unsafe extern "C" fn(NnModel, i32, NnMemory, usize, usize) -> c_int;
type FnModelAddOperation = unsafe extern "C" fn(NnModel, i32, u32, *const u32, u32, *const u32) -> c_int;
type FnModelIdentifyInputsAndOutputs = unsafe extern "C" fn(NnModel, u32, *const u32, u32, *const u32) -> c_int;
type FnCompilationCreate = unsafe extern "C" fn(NnModel, *mut NnCompilation) -> c_int;
type FnCompilationFree = unsafe extern "C" fn(NnCompilation);
type FnCompilationSetPreference = unsafe extern "C" fn(NnCompilation, i32) -> c_int;
type FnCompilationFinish = unsafe extern "C" fn(NnCompilation) -> c_int;
type FnExecutionCreate = unsafe extern "C" fn(NnCompilation, *mut NnExecution) -> c_int;
type FnExecutionFree = unsafe extern "C" fn(NnExecution);
type FnExecutionSetInput =
    unsafe extern "C" fn(NnExecution, i32, *const ANeuralNetworksOperandType, *const c_void, usize) -> c_int;
type FnExecutionSetInputFromMemory =
    unsafe extern "C" fn(NnExecution, i32, *const ANeuralNetworksOperandType, NnMemory, usize, usize) -> c_int;
type FnExecutionSetOutput =
    unsafe extern "C" fn(NnExecution, i32, *const ANeuralNetworksOperandType, *mut c_void, usize) -> c_int;
type FnExecutionSetOutputFromMemory =
    unsafe extern "C" fn(NnExecution, i32, *const ANeuralNetworksOperandType, NnMemory, usize, usize) -> c_int;
type FnExecutionStartCompute = unsafe extern "C" fn(NnExecution, *mut NnEvent) -> c_int;
type FnEventWait = unsafe extern "C" fn(NnEvent) -> c_int;
type FnEventFree = unsafe extern "C" fn(NnEvent);

type FnSharedMemoryCreate = unsafe extern "C" fn(*const c_char, usize) -> c_int;

// ---------------------------------------------------------------------------
// Loaded API
// ---------------------------------------------------------------------------

pub struct NnApi {
    _nn: Library,
    _android: Library,
    pub memory_create_from_fd: FnMemoryCreateFromFd,
    pub memory_free: FnMemoryFree,
    pub model_create: FnModelCreate,
    pub model_free: FnModelFree,
    pub model_finish: FnModelFinish,
    pub model_add_operand: FnModelAddOperand,
    pub model_set_operand_value: FnModelSetOperandValue,
    pub model_set_operand_value_from_memory: FnModelSetOperandValueFromMemory,
    pub model_add_operation: FnModelAddOperation,
    pub model_identify_inputs_and_outputs: FnModelIdentifyInputsAndOutputs,
    pub compilation_create: FnCompilationCreate,
    pub compilation_free: FnCompilationFree,
    pub compilation_set_preference: FnCompilationSetPreference,
    pub compilation_finish: FnCompilationFinish,
    pub execution_create: FnExecutionCreate,
    pub execution_free: FnExecutionFree,
    pub execution_set_input: FnExecutionSetInput,
    pub execution_set_input_from_memory: FnExecutionSetInputFromMemory,
    pub execution_set_output: FnExecutionSetOutput,
    pub execution_set_output_from_memory: FnExecutionSetOutputFromMemory,
    pub execution_start_compute: FnExecutionStartCompute,
    pub event_wait: FnEventWait,
    pub event_free: FnEventFree,
    pub shared_memory_create: FnSharedMemoryCreate,
}

// Safety: NNAPI objects are only touched by the thread that owns them; the
// function pointers themselves are process-global.
unsafe impl Send for NnApi {}
unsafe impl Sync for NnApi {}

static NN_API: OnceLock<Option<NnApi>> = OnceLock::new();

impl NnApi {
    fn try_load() -> Option<Self> {
        let nn = unsafe { Library::new("libneuralnetworks.so") }.ok()?;
        let android = unsafe { Library::new("libandroid.so") }.ok()?;
        unsafe {
            let api = NnApi {
                memory_create_from_fd: *nn
                    .get::<FnMemoryCreateFromFd>(b"ANeuralNetworksMemory_createFromFd\0")
                    .ok()?,
                memory_free: *nn.get::<FnMemoryFree>(b"ANeuralNetworksMemory_free\0").ok()?,
                model_create: *nn.get::<FnModelCreate>(b"ANeuralNetworksModel_create\0").ok()?,
                model_free: *nn.get::<FnModelFree>(b"ANeuralNetworksModel_free\0").ok()?,
                model_finish: *nn.get::<FnModelFinish>(b"ANeuralNetworksModel_finish\0").ok()?,
                model_add_operand: *nn.get::<FnModelAddOperand>(b"ANeuralNetworksModel_addOperand\0").ok()?,
                model_set_operand_value: *nn
                    .get::<FnModelSetOperandValue>(b"ANeuralNetworksModel_setOperandValue\0")
                    .ok()?,
                model_set_operand_value_from_memory: *nn
                    .get::<FnModelSetOperandValueFromMemory>(b"ANeuralNetworksModel_setOperandValueFromMemory\0")
                    .ok()?,
                model_add_operation: *nn
                    .get::<FnModelAddOperation>(b"ANeuralNetworksModel_addOperation\0")
                    .ok()?,
                model_identify_inputs_and_outputs: *nn
                    .get::<FnModelIdentifyInputsAndOutputs>(b"ANeuralNetworksModel_identifyInputsAndOutputs\0")
                    .ok()?,
                compilation_create: *nn
                    .get::<FnCompilationCreate>(b"ANeuralNetworksCompilation_create\0")
                    .ok()?,
                compilation_free: *nn.get::<FnCompilationFree>(b"ANeuralNetworksCompilation_free\0").ok()?,
                compilation_set_preference: *nn
                    .get::<FnCompilationSetPreference>(b"ANeuralNetworksCompilation_setPreference\0")
                    .ok()?,
                compilation_finish: *nn
                    .get::<FnCompilationFinish>(b"ANeuralNetworksCompilation_finish\0")
                    .ok()?,
                execution_create: *nn.get::<FnExecutionCreate>(b"ANeuralNetworksExecution_create\0").ok()?,
                execution_free: *nn.get::<FnExecutionFree>(b"ANeuralNetworksExecution_free\0").ok()?,
                execution_set_input: *nn
                    .get::<FnExecutionSetInput>(b"ANeuralNetworksExecution_setInput\0")
                    .ok()?,
                execution_set_input_from_memory: *nn
                    .get::<FnExecutionSetInputFromMemory>(b"ANeuralNetworksExecution_setInputFromMemory\0")
                    .ok()?,
                execution_set_output: *nn
                    .get::<FnExecutionSetOutput>(b"ANeuralNetworksExecution_setOutput\0")
                    .ok()?,
                execution_set_output_from_memory: *nn
                    .get::<FnExecutionSetOutputFromMemory>(b"ANeuralNetworksExecution_setOutputFromMemory\0")
                    .ok()?,
                execution_start_compute: *nn
                    .get::<FnExecutionStartCompute>(b"ANeuralNetworksExecution_startCompute\0")
                    .ok()?,
                event_wait: *nn.get::<FnEventWait>(b"ANeuralNetworksEvent_wait\0").ok()?,
                event_free: *nn.get::<FnEventFree>(b"ANeuralNetworksEvent_free\0").ok()?,
                shared_memory_create: *android.get::<FnSharedMemoryCreate>(b"ASharedMemory_create\0").ok()?,
                _nn: nn,
                _android: android,
            };
            Some(api)
        }
    }
}

/// Get the runtime-loaded NNAPI. Returns None off-device.
pub fn nnapi_api() -> Option<&'static NnApi> {
    NN_API.get_or_init(NnApi::try_load).as_ref()
}

/// Check an NNAPI return code.
pub fn check_nn(code: c_int, call: &'static str) -> Result<(), EngineError> {
    if code == ANEURALNETWORKS_NO_ERROR {
        Ok(())
    } else {
        Err(EngineError::Driver { device: DeviceKind::Npu, call, code })
    }
}
